//! The synthetic client handler.

use crate::stage::{Stage, StageKind};

/// Handler installed for the client role. Response body packets gather on
/// its read queue for the application to drain; everything else is the
/// default behavior.
pub struct ClientHandler;

impl ClientHandler {
    pub(crate) fn new() -> ClientHandler {
        ClientHandler
    }
}

impl Stage for ClientHandler {
    fn name(&self) -> &str {
        "client"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }
}
