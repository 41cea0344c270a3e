//! The action handler: URI-bound application callbacks.

use crate::conn::{Conn, Fault};
use crate::queue::QueueId;
use crate::stage::{Stage, StageKind};

/// Dispatches requests to callbacks registered on the engine by URI. The
/// callback writes the response; if it forgets to finalize, the handler
/// does it afterwards.
pub struct ActionHandler;

impl ActionHandler {
    pub(crate) fn new() -> ActionHandler {
        ActionHandler
    }
}

impl Stage for ActionHandler {
    fn name(&self) -> &str {
        "actionHandler"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    fn ready(&self, conn: &mut Conn, _q: QueueId) {
        let uri = match conn.rx.as_ref() {
            Some(rx) => rx.uri.clone(),
            None => return,
        };
        let action = conn.engine().action(&uri);
        match action {
            Some(action) => {
                (action.as_ref())(conn);
                conn.finalize();
            }
            None => {
                conn.error(
                    Fault::status(404),
                    format!("No action defined for \"{}\"", uri),
                );
            }
        }
    }
}
