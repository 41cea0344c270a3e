//! The range filter: single-range partial responses.

use http::header::{HeaderValue, CONTENT_RANGE, RANGE};

use crate::conn::{Conn, Fault};
use crate::packet::{Packet, PacketKind};
use crate::pipeline::{self, Schedule};
use crate::queue::{Dir, QueueId};
use crate::route::Route;
use crate::stage::{Stage, StageKind};

/// Serves `Range: bytes=start-end` requests with `206 Partial Content`.
///
/// Only a single range is supported; multipart ranges and suffix ranges
/// are ignored and the full entity is served. An unsatisfiable range on an
/// entity of known length yields `416`.
pub struct RangeFilter;

impl RangeFilter {
    pub(crate) fn new() -> RangeFilter {
        RangeFilter
    }
}

impl Stage for RangeFilter {
    fn name(&self) -> &str {
        "rangeFilter"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn matches(&self, conn: &Conn, _route: &Route, dir: Dir) -> bool {
        dir == Dir::Tx
            && conn.is_server()
            && conn
                .rx()
                .map_or(false, |rx| rx.headers.contains_key(RANGE))
    }

    fn open(&self, conn: &mut Conn, _q: QueueId) {
        let spec = conn
            .rx
            .as_ref()
            .and_then(|rx| rx.headers.get(RANGE))
            .and_then(|value| value.to_str().ok())
            .and_then(parse_single_range);
        if let Some(tx) = conn.tx.as_mut() {
            tx.range = spec;
        }
    }

    fn outgoing(&self, conn: &mut Conn, q: QueueId, packet: Packet) {
        match packet.kind() {
            PacketKind::Header => {
                self.apply_range_to_head(conn, q, packet);
            }
            PacketKind::Data => {
                let active = conn
                    .tx
                    .as_ref()
                    .map_or(false, |tx| tx.range.is_some() && tx.status == 206);
                if !active {
                    pipeline::put_for_service(conn, q, packet, Schedule::Now);
                    return;
                }
                if let Some(trimmed) = trim_to_range(conn, packet) {
                    pipeline::put_for_service(conn, q, trimmed, Schedule::Now);
                }
            }
            PacketKind::End => {
                pipeline::put_for_service(conn, q, packet, Schedule::Now);
            }
        }
    }
}

impl RangeFilter {
    fn apply_range_to_head(&self, conn: &mut Conn, q: QueueId, packet: Packet) {
        let (spec, status, length) = match conn.tx.as_ref() {
            Some(tx) => (tx.range, tx.status, tx.content_length),
            None => (None, 0, None),
        };
        let (start, end) = match spec {
            Some(spec) if status == 200 => spec,
            _ => {
                pipeline::put_for_service(conn, q, packet, Schedule::Now);
                return;
            }
        };
        match length {
            Some(len) if start >= len => {
                // The handler's output is useless now; replace it with the
                // engine's error response behind the same header packet.
                pipeline::discard_data(conn, Dir::Tx);
                if let Some(tx) = conn.tx.as_mut() {
                    tx.range = None;
                    tx.finalized = false;
                    tx.bytes_written = 0;
                    tx.content_length = None;
                }
                conn.error(
                    Fault::status(416),
                    format!("Range of {}-{} is not satisfiable", start, end),
                );
                pipeline::put_for_service(conn, q, packet, Schedule::Now);
            }
            Some(len) => {
                let end = end.min(len);
                if let Some(tx) = conn.tx.as_mut() {
                    tx.status = 206;
                    tx.range = Some((start, end));
                    tx.content_length = Some(end - start);
                    let value = format!("bytes {}-{}/{}", start, end - 1, len);
                    if let Ok(value) = HeaderValue::from_str(&value) {
                        tx.headers.insert(CONTENT_RANGE, value);
                    }
                }
                pipeline::put_for_service(conn, q, packet, Schedule::Now);
            }
            None => {
                // Streaming output of unknown length: serve it whole.
                if let Some(tx) = conn.tx.as_mut() {
                    tx.range = None;
                }
                pipeline::put_for_service(conn, q, packet, Schedule::Now);
            }
        }
    }
}

/// Keep only the packet bytes that fall inside the active range.
fn trim_to_range(conn: &mut Conn, packet: Packet) -> Option<Packet> {
    let tx = conn.tx.as_mut()?;
    let (start, end) = tx.range?;
    let offset = tx.range_progress;
    let len = packet.len() as u64;
    tx.range_progress += len;

    let take_from = start.saturating_sub(offset).min(len);
    let take_to = end.saturating_sub(offset).min(len);
    if take_from >= take_to {
        return None;
    }
    let mut packet = packet;
    let mut window = packet.split_to(take_to as usize);
    let _ = window.split_to(take_from as usize);
    Some(window)
}

/// Parse `bytes=start-end` (end inclusive) or `bytes=start-`.
fn parse_single_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = end.trim();
    if end.is_empty() {
        Some((start, u64::MAX))
    } else {
        let end: u64 = end.parse().ok()?;
        if end < start {
            return None;
        }
        Some((start, end + 1))
    }
}
