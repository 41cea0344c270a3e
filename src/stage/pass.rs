//! The pass handler.

use crate::conn::Conn;
use crate::queue::QueueId;
use crate::stage::{Stage, StageKind};

/// Default handler for requests that need no application output: whatever
/// the application wrote (possibly nothing) passes straight through, and
/// the response is finalized as soon as the request is ready.
pub struct PassHandler;

impl PassHandler {
    pub(crate) fn new() -> PassHandler {
        PassHandler
    }
}

impl Stage for PassHandler {
    fn name(&self) -> &str {
        "passHandler"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    fn ready(&self, conn: &mut Conn, _q: QueueId) {
        conn.finalize();
    }
}
