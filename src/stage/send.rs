//! The send connector: file transmission with kernel assistance.

use std::io;

use bytes::Bytes;

use crate::conn::{Conn, Fault};
use crate::packet::PacketKind;
use crate::queue::QueueId;
use crate::stage::net::{drain_to_transport, write_bytes};
use crate::stage::{Stage, StageKind};
use crate::status;

/// Connector selected for plain file GETs: no output filters, no TLS, no
/// body tracing. Hands the file region to [`crate::Transport::sendfile`]
/// and falls back to buffered writes when the transport cannot.
pub struct SendConnector;

impl SendConnector {
    pub(crate) fn new() -> SendConnector {
        SendConnector
    }
}

impl Stage for SendConnector {
    fn name(&self) -> &str {
        "sendConnector"
    }

    fn kind(&self) -> StageKind {
        StageKind::Connector
    }

    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) {
        // Let the shared loop emit the head first.
        if conn
            .queues
            .get(q)
            .first_kind()
            .map_or(false, |kind| kind == PacketKind::Header)
        {
            let packet = match conn.queues.take(q) {
                Some(packet) => packet,
                None => return,
            };
            debug_assert!(packet.kind() == PacketKind::Header);
            let created = conn.tx.as_ref().map_or(true, |tx| tx.headers_created);
            if !created {
                let head = conn.render_head();
                if !head.is_empty() && !write_bytes(conn, q, head) {
                    return;
                }
            }
        }
        if !stream_file(conn, q) {
            return;
        }
        drain_to_transport(conn, q);
    }
}

fn stream_file(conn: &mut Conn, q: QueueId) -> bool {
    let pending = match conn.tx.as_ref() {
        Some(tx) if !tx.sendfile => tx.filename.clone(),
        _ => None,
    };
    let path = match pending {
        Some(path) => path,
        None => return true,
    };
    let len = conn
        .tx
        .as_ref()
        .and_then(|tx| tx.content_length)
        .unwrap_or(0);
    if let Some(tx) = conn.tx.as_mut() {
        tx.sendfile = true;
    }
    match conn.transport.sendfile(&path, 0, len) {
        Ok(_) => true,
        Err(ref err) if err.kind() == io::ErrorKind::Unsupported => {
            tracing::debug!(path = %path.display(), "transport lacks sendfile, buffering");
            match std::fs::read(&path) {
                Ok(contents) => write_bytes(conn, q, Bytes::from(contents)),
                Err(err) => {
                    let msg = err.to_string();
                    conn.error(
                        Fault::abort(500),
                        format!("Cannot open document: {}", msg),
                    );
                    false
                }
            }
        }
        Err(err) => {
            let msg = err.to_string();
            conn.error(
                Fault::abort(status::COMMS_ERROR),
                format!("Comms error: {}", msg),
            );
            false
        }
    }
}
