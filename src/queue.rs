//! Packet queues and the per-connection service schedule.
//!
//! Queues are stored in a per-connection arena and addressed by stable
//! [`QueueId`] indices. Each queue is doubly linked into its direction's
//! chain (a circular list rooted at a head sentinel) and, independently,
//! may sit in the connection's service schedule. The `pair` cross-link to
//! the same stage's queue in the opposite direction is a plain index and
//! never implies ownership.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::packet::{Packet, PacketKind};
use crate::stage::Stage;

/// Stable index of a queue within its connection's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) usize);

/// Direction of packet travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// Toward the connector (transmit).
    Tx,
    /// Toward the handler (receive).
    Rx,
}

impl Dir {
    pub(crate) fn index(self) -> usize {
        match self {
            Dir::Tx => 0,
            Dir::Rx => 1,
        }
    }
}

pub(crate) struct Queue {
    pub(crate) stage: Arc<dyn Stage>,
    pub(crate) dir: Dir,
    pub(crate) pair: Option<QueueId>,
    next: QueueId,
    prev: QueueId,
    packets: VecDeque<Packet>,
    pub(crate) count: usize,
    pub(crate) max: usize,
    pub(crate) open: bool,
    pub(crate) started: bool,
    pub(crate) servicing: bool,
    pub(crate) reservice: bool,
    scheduled: bool,
    head: bool,
}

impl Queue {
    pub(crate) fn first_kind(&self) -> Option<PacketKind> {
        self.packets.front().map(|p| p.kind())
    }

    pub(crate) fn has_packets(&self) -> bool {
        !self.packets.is_empty()
    }
}

/// Arena of queues plus the service schedule for one connection.
pub(crate) struct QueueSet {
    queues: Vec<Queue>,
    schedule: VecDeque<QueueId>,
}

impl QueueSet {
    pub(crate) fn new() -> QueueSet {
        QueueSet {
            queues: Vec::new(),
            schedule: VecDeque::new(),
        }
    }

    /// Create a self-linked head sentinel for one direction's chain.
    pub(crate) fn create_head(&mut self, stage: Arc<dyn Stage>, dir: Dir, max: usize) -> QueueId {
        let id = QueueId(self.queues.len());
        self.queues.push(Queue {
            stage,
            dir,
            pair: None,
            next: id,
            prev: id,
            packets: VecDeque::new(),
            count: 0,
            max,
            open: false,
            started: false,
            servicing: false,
            reservice: false,
            scheduled: false,
            head: true,
        });
        id
    }

    /// Append a queue at the tail of `head`'s chain (just before the head).
    pub(crate) fn append(
        &mut self,
        head: QueueId,
        stage: Arc<dyn Stage>,
        dir: Dir,
        max: usize,
    ) -> QueueId {
        let id = QueueId(self.queues.len());
        let tail = self.queues[head.0].prev;
        self.queues.push(Queue {
            stage,
            dir,
            pair: None,
            next: head,
            prev: tail,
            packets: VecDeque::new(),
            count: 0,
            max,
            open: false,
            started: false,
            servicing: false,
            reservice: false,
            scheduled: false,
            head: false,
        });
        self.queues[tail.0].next = id;
        self.queues[head.0].prev = id;
        id
    }

    pub(crate) fn get(&self, q: QueueId) -> &Queue {
        &self.queues[q.0]
    }

    pub(crate) fn get_mut(&mut self, q: QueueId) -> &mut Queue {
        &mut self.queues[q.0]
    }

    pub(crate) fn next(&self, q: QueueId) -> QueueId {
        self.queues[q.0].next
    }

    pub(crate) fn prev(&self, q: QueueId) -> QueueId {
        self.queues[q.0].prev
    }

    pub(crate) fn is_head(&self, q: QueueId) -> bool {
        self.queues[q.0].head
    }

    /// The chain members of `head`, in order, excluding the head itself.
    pub(crate) fn chain(&self, head: QueueId) -> Vec<QueueId> {
        let mut out = Vec::new();
        let mut q = self.next(head);
        while q != head {
            out.push(q);
            q = self.next(q);
        }
        out
    }

    /// Put a queue on the service schedule.
    ///
    /// A queue is in the schedule iff it has pending work and is not being
    /// serviced; re-scheduling a listed queue is a no-op.
    pub(crate) fn schedule(&mut self, q: QueueId) {
        let queue = &mut self.queues[q.0];
        if queue.head || queue.scheduled {
            return;
        }
        queue.scheduled = true;
        self.schedule.push_back(q);
    }

    /// Take the next queue due for service, if any.
    pub(crate) fn next_for_service(&mut self) -> Option<QueueId> {
        let q = self.schedule.pop_front()?;
        self.queues[q.0].scheduled = false;
        Some(q)
    }

    pub(crate) fn put(&mut self, q: QueueId, packet: Packet) {
        let queue = &mut self.queues[q.0];
        queue.count += packet.len();
        queue.packets.push_back(packet);
    }

    /// Return a partially consumed packet to the front of its queue.
    pub(crate) fn put_back(&mut self, q: QueueId, packet: Packet) {
        let queue = &mut self.queues[q.0];
        queue.count += packet.len();
        queue.packets.push_front(packet);
    }

    pub(crate) fn take(&mut self, q: QueueId) -> Option<Packet> {
        let queue = &mut self.queues[q.0];
        let packet = queue.packets.pop_front()?;
        queue.count -= packet.len();
        Some(packet)
    }

    /// Drop all buffered packets without invoking any stage.
    pub(crate) fn discard(&mut self, q: QueueId) {
        let queue = &mut self.queues[q.0];
        queue.packets.clear();
        queue.count = 0;
    }
}
