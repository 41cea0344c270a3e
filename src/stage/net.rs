//! The net connector: terminal transmit stage writing to the transport.

use std::io;

use bytes::Bytes;

use crate::conn::{Conn, Fault};
use crate::packet::{Packet, PacketKind};
use crate::queue::QueueId;
use crate::stage::{Stage, StageKind};
use crate::status;

/// Default connector. Serializes the message head when it services the
/// header packet, then streams payload packets to the transport without
/// blocking. A severed transport surfaces as `550 Comms Error`.
pub struct NetConnector;

impl NetConnector {
    pub(crate) fn new() -> NetConnector {
        NetConnector
    }
}

impl Stage for NetConnector {
    fn name(&self) -> &str {
        "netConnector"
    }

    fn kind(&self) -> StageKind {
        StageKind::Connector
    }

    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) {
        drain_to_transport(conn, q);
    }
}

/// Shared connector service loop.
///
/// Also used by the send connector for everything except the file body.
pub(crate) fn drain_to_transport(conn: &mut Conn, q: QueueId) {
    loop {
        let packet = match conn.queues.take(q) {
            Some(packet) => packet,
            None => return,
        };
        match packet.kind() {
            PacketKind::Header => {
                let created = conn.tx.as_ref().map_or(true, |tx| tx.headers_created);
                if created {
                    continue;
                }
                let head = conn.render_head();
                if !head.is_empty() && !write_bytes(conn, q, head) {
                    return;
                }
            }
            PacketKind::Data => {
                if !write_bytes(conn, q, packet.into_payload()) {
                    return;
                }
            }
            PacketKind::End => {
                conn.connector_completed();
                return;
            }
        }
    }
}

/// Write bytes to the transport, suspending on would-block by returning the
/// unwritten remainder to the queue front. Returns false when the caller
/// must stop servicing.
pub(crate) fn write_bytes(conn: &mut Conn, q: QueueId, mut data: Bytes) -> bool {
    while !data.is_empty() {
        if conn.is_disconnected() {
            return false;
        }
        match conn.transport.send(&data) {
            Ok(0) => {
                conn.queues.put_back(q, Packet::data(data));
                return false;
            }
            Ok(n) => {
                let _ = data.split_to(n);
                conn.touch();
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                conn.queues.put_back(q, Packet::data(data));
                return false;
            }
            Err(err) => {
                tracing::error!(error = %err, "connector write failed");
                let msg = err.to_string();
                conn.error(
                    Fault::abort(status::COMMS_ERROR),
                    format!("Comms error: {}", msg),
                );
                return false;
            }
        }
    }
    true
}
