//! The upload filter: receive-side body accounting and limits.

use crate::conn::{Conn, Fault};
use crate::packet::{Packet, PacketKind};
use crate::pipeline::{self, Schedule};
use crate::queue::QueueId;
use crate::stage::{Stage, StageKind};

/// Accounts received body bytes and rejects bodies that exceed the upload
/// or receive limits with `413`.
pub struct UploadFilter;

impl UploadFilter {
    pub(crate) fn new() -> UploadFilter {
        UploadFilter
    }
}

impl Stage for UploadFilter {
    fn name(&self) -> &str {
        "uploadFilter"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn incoming(&self, conn: &mut Conn, q: QueueId, packet: Packet) {
        if packet.kind() != PacketKind::Data {
            pipeline::put_for_service(conn, q, packet, Schedule::Now);
            return;
        }
        let upload_limit = conn.limits.upload_size;
        let body_limit = conn.limits.receive_body_size;
        let received = match conn.rx.as_mut() {
            Some(rx) => {
                rx.bytes_received += packet.len() as u64;
                rx.bytes_received
            }
            None => return,
        };
        if received > upload_limit {
            conn.error(
                Fault::close(413),
                format!("Uploaded content exceeds max upload size of {}", upload_limit),
            );
            return;
        }
        if received > body_limit {
            conn.error(
                Fault::close(413),
                format!("Receive body of {} bytes exceeds max body size of {}", received, body_limit),
            );
            return;
        }
        pipeline::put_for_service(conn, q, packet, Schedule::Now);
    }
}
