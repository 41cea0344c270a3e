//! The unit of data moving through queues.

use bytes::Bytes;

/// What a packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Placeholder for the not-yet-serialized message head.
    Header,
    /// A slice of body payload.
    Data,
    /// End of stream. No further packets follow in this direction.
    End,
}

/// A buffered unit of data traversing a queue chain.
///
/// Packets are owned by the queue currently holding them; handoff between
/// queues is by dequeue/enqueue. Filters may split a packet but must never
/// reorder packets within a direction.
#[derive(Debug, Clone)]
pub struct Packet {
    kind: PacketKind,
    data: Bytes,
}

impl Packet {
    /// The header placeholder enqueued ahead of any body data.
    pub fn header() -> Packet {
        Packet {
            kind: PacketKind::Header,
            data: Bytes::new(),
        }
    }

    /// A payload packet.
    pub fn data(data: Bytes) -> Packet {
        Packet {
            kind: PacketKind::Data,
            data,
        }
    }

    /// The end-of-stream marker.
    pub fn end() -> Packet {
        Packet {
            kind: PacketKind::End,
            data: Bytes::new(),
        }
    }

    /// The packet kind.
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Whether this is the end-of-stream marker.
    pub fn is_end(&self) -> bool {
        self.kind == PacketKind::End
    }

    /// The payload slice. Empty for header and end packets.
    pub fn payload(&self) -> &Bytes {
        &self.data
    }

    /// Take the payload out of the packet.
    pub fn into_payload(self) -> Bytes {
        self.data
    }

    /// Number of payload bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the packet carries no payload bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Split off the first `at` payload bytes into a new packet.
    ///
    /// `self` keeps the remainder. Splitting is how filters bound packet
    /// sizes without copying.
    pub fn split_to(&mut self, at: usize) -> Packet {
        debug_assert!(at <= self.data.len());
        Packet {
            kind: self.kind,
            data: self.data.split_to(at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_preserves_order_and_kind() {
        let mut pkt = Packet::data(Bytes::from_static(b"hello world"));
        let first = pkt.split_to(5);
        assert_eq!(first.kind(), PacketKind::Data);
        assert_eq!(first.payload().as_ref(), b"hello");
        assert_eq!(pkt.payload().as_ref(), b" world");
    }

    #[test]
    fn markers_are_empty() {
        assert!(Packet::header().is_empty());
        assert!(Packet::end().is_end());
        assert_eq!(Packet::end().len(), 0);
    }
}
