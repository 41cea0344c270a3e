//! Pipeline stages.
//!
//! A stage is a polymorphic pipeline element with a fixed callback set; any
//! callback may be left at its default. Stages are classified as handlers
//! (originate a response or consume a request body), filters (transform
//! packets in flight), or connectors (terminal transmit stage performing
//! transport I/O).
//!
//! One stage instance is shared by every pipeline that selects it; all
//! per-request state lives on the connection, never on the stage.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::conn::Conn;
use crate::packet::Packet;
use crate::pipeline;
use crate::queue::{Dir, QueueId};
use crate::route::Route;

mod action;
mod cache;
pub(crate) mod chunk;
mod client;
pub(crate) mod net;
mod pass;
mod range;
mod send;
mod upload;

pub use self::action::ActionHandler;
pub use self::cache::CacheHandler;
pub use self::chunk::ChunkFilter;
pub use self::client::ClientHandler;
pub use self::net::NetConnector;
pub use self::pass::PassHandler;
pub use self::range::RangeFilter;
pub use self::send::SendConnector;
pub use self::upload::UploadFilter;

/// Classification of a stage within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Terminal in TX order; originates the response.
    Handler,
    /// Any intermediate position.
    Filter,
    /// Terminal in TX; performs transport I/O.
    Connector,
}

/// A pipeline element.
///
/// The default implementations store incoming packets on the stage's own
/// queue for later service, and the default service routine forwards
/// buffered packets to the next queue in the direction of travel. Stages
/// override exactly the callbacks they care about.
pub trait Stage: Send + Sync {
    /// Registry name, lowercase by convention.
    fn name(&self) -> &str;

    /// Handler, filter, or connector.
    fn kind(&self) -> StageKind;

    /// File extensions this stage applies to, if it is extension-scoped.
    fn extensions(&self) -> Option<&HashSet<String>> {
        None
    }

    /// Decide whether this stage joins the pipeline for a request.
    ///
    /// The default consults [`Stage::extensions`] when the transmit side
    /// has a file extension; otherwise the stage matches.
    fn matches(&self, conn: &Conn, _route: &Route, _dir: Dir) -> bool {
        match (self.extensions(), conn.tx().and_then(|tx| tx.ext.as_deref())) {
            (Some(exts), Some(ext)) => exts.contains(ext),
            _ => true,
        }
    }

    /// Called once per queue pair when the pipeline is assembled.
    fn open(&self, _conn: &mut Conn, _q: QueueId) {}

    /// Called once per opened queue when the pipeline is torn down.
    fn close(&self, _conn: &mut Conn, _q: QueueId) {}

    /// Called once per queue pair when the request starts processing.
    fn start(&self, _conn: &mut Conn, _q: QueueId) {}

    /// Called on the handler when the request may begin producing output.
    fn ready(&self, _conn: &mut Conn, _q: QueueId) {}

    /// Called on the handler when the connection can accept more output.
    ///
    /// Returns `false` when the stage has no writable capability, which
    /// tells the pump there is nothing to drive.
    fn writable(&self, _conn: &mut Conn, _q: QueueId) -> bool {
        false
    }

    /// Accept a packet traveling toward the handler (receive direction).
    fn incoming(&self, conn: &mut Conn, q: QueueId, packet: Packet) {
        pipeline::put_for_service(conn, q, packet, pipeline::Schedule::Now);
    }

    /// Accept a packet traveling toward the connector (transmit direction).
    fn outgoing(&self, conn: &mut Conn, q: QueueId, packet: Packet) {
        pipeline::put_for_service(conn, q, packet, pipeline::Schedule::Now);
    }

    /// Drain buffered receive-direction packets.
    fn incoming_service(&self, conn: &mut Conn, q: QueueId) {
        pipeline::default_service(conn, q);
    }

    /// Drain buffered transmit-direction packets.
    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) {
        pipeline::default_service(conn, q);
    }
}

impl fmt::Debug for dyn Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Sentinel stage owning the chain head queues. Never serviced.
pub(crate) struct HeadStage;

impl Stage for HeadStage {
    fn name(&self) -> &str {
        "head"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }
}

/// The stage registry: lowercase name to shared stage.
///
/// Populated during engine initialization with the built-ins; additional
/// stages may be registered before any connection is processed. Lookups
/// after that point are read-only.
#[derive(Default)]
pub(crate) struct Registry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry::default()
    }

    pub(crate) fn add(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.name().to_ascii_lowercase(), stage);
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(&name.to_ascii_lowercase()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    impl Stage for Probe {
        fn name(&self) -> &str {
            "Probe"
        }

        fn kind(&self) -> StageKind {
            StageKind::Filter
        }
    }

    #[test]
    fn registry_is_case_insensitive() {
        let mut registry = Registry::new();
        registry.add(Arc::new(Probe));
        assert!(registry.lookup("probe").is_some());
        assert!(registry.lookup("PROBE").is_some());
        assert!(registry.lookup("other").is_none());
    }
}
