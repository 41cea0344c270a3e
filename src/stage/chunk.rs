//! The chunk filter: chunked transfer coding in both directions.
//!
//! Transmit side: when no content length is known by the time the header
//! packet passes, the response switches to chunked coding and every data
//! packet is framed, capped at the connection's chunk size. Receive side:
//! an incremental decoder reassembles chunk payloads and signals end of
//! body at the terminating chunk.

use bytes::{Bytes, BytesMut};

use crate::conn::{Conn, Fault};
use crate::packet::{Packet, PacketKind};
use crate::pipeline::{self, Schedule};
use crate::queue::QueueId;
use crate::stage::{Stage, StageKind};

/// Chunked transfer coding filter.
pub struct ChunkFilter;

impl ChunkFilter {
    pub(crate) fn new() -> ChunkFilter {
        ChunkFilter
    }
}

impl Stage for ChunkFilter {
    fn name(&self) -> &str {
        "chunkFilter"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn outgoing(&self, conn: &mut Conn, q: QueueId, packet: Packet) {
        let (chunked, chunk_size) = match conn.tx.as_mut() {
            Some(tx) => {
                if packet.kind() == PacketKind::Header
                    && tx.content_length.is_none()
                    && tx.chunk_size > 0
                {
                    tx.chunked = true;
                }
                (tx.chunked, tx.chunk_size)
            }
            None => (false, 0),
        };
        if !chunked {
            pipeline::put_for_service(conn, q, packet, Schedule::Now);
            return;
        }
        match packet.kind() {
            PacketKind::Header => {
                pipeline::put_for_service(conn, q, packet, Schedule::Now);
            }
            PacketKind::Data => {
                let mut packet = packet;
                while packet.len() > chunk_size {
                    let piece = packet.split_to(chunk_size);
                    let framed = frame(piece.into_payload());
                    pipeline::put_for_service(conn, q, Packet::data(framed), Schedule::Now);
                }
                if !packet.is_empty() {
                    let framed = frame(packet.into_payload());
                    pipeline::put_for_service(conn, q, Packet::data(framed), Schedule::Now);
                }
            }
            PacketKind::End => {
                let terminator = Bytes::from_static(b"0\r\n\r\n");
                pipeline::put_for_service(conn, q, Packet::data(terminator), Schedule::Now);
                pipeline::put_for_service(conn, q, packet, Schedule::Now);
            }
        }
    }

    fn incoming(&self, conn: &mut Conn, q: QueueId, packet: Packet) {
        let chunked = conn.rx.as_ref().map_or(false, |rx| rx.chunked);
        if !chunked || packet.kind() != PacketKind::Data {
            pipeline::put_for_service(conn, q, packet, Schedule::Now);
            return;
        }
        let mut decoded = Vec::new();
        let outcome = match conn.rx.as_mut() {
            Some(rx) => rx.dechunk.decode(packet.into_payload(), &mut decoded),
            None => return,
        };
        for piece in decoded {
            pipeline::put_for_service(conn, q, Packet::data(piece), Schedule::Now);
        }
        match outcome {
            Ok(Dechunked::NeedMore) => {}
            Ok(Dechunked::Done { leftover }) => {
                pipeline::put_for_service(conn, q, Packet::end(), Schedule::Now);
                conn.unread_input(leftover);
                conn.rx_body_complete();
            }
            Err(()) => {
                conn.error(Fault::close(400), "Bad chunk specification");
            }
        }
    }
}

fn frame(data: Bytes) -> Bytes {
    let header = format!("{:x}\r\n", data.len());
    let mut framed = BytesMut::with_capacity(header.len() + data.len() + 2);
    framed.extend_from_slice(header.as_bytes());
    framed.extend_from_slice(&data);
    framed.extend_from_slice(b"\r\n");
    framed.freeze()
}

/// Decoder progress after consuming one input slice.
pub(crate) enum Dechunked {
    /// More input needed.
    NeedMore,
    /// Terminating chunk seen; `leftover` holds bytes past the body.
    Done { leftover: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DechunkState {
    Size,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLine,
    TrailerLf,
    Done,
}

/// Incremental chunked-coding decoder. One per request, owned by RX.
pub(crate) struct Dechunker {
    state: DechunkState,
    chunk_len: u64,
    seen_digits: bool,
}

impl Dechunker {
    pub(crate) fn new() -> Dechunker {
        Dechunker {
            state: DechunkState::Size,
            chunk_len: 0,
            seen_digits: false,
        }
    }

    /// Consume `data`, appending decoded payload slices to `out`.
    pub(crate) fn decode(
        &mut self,
        mut data: Bytes,
        out: &mut Vec<Bytes>,
    ) -> Result<Dechunked, ()> {
        while !data.is_empty() {
            match self.state {
                DechunkState::Size => {
                    let byte = data[0];
                    match hex_value(byte) {
                        Some(digit) => {
                            // Chunk sizes are bounded well below overflow.
                            self.chunk_len = self
                                .chunk_len
                                .checked_mul(16)
                                .and_then(|len| len.checked_add(u64::from(digit)))
                                .ok_or(())?;
                            self.seen_digits = true;
                            let _ = data.split_to(1);
                        }
                        None if !self.seen_digits => return Err(()),
                        None => match byte {
                            b';' => {
                                self.state = DechunkState::Extension;
                                let _ = data.split_to(1);
                            }
                            b'\r' => {
                                self.state = DechunkState::SizeLf;
                                let _ = data.split_to(1);
                            }
                            _ => return Err(()),
                        },
                    }
                }
                DechunkState::Extension => {
                    match data.iter().position(|&b| b == b'\r') {
                        Some(at) => {
                            let _ = data.split_to(at + 1);
                            self.state = DechunkState::SizeLf;
                        }
                        None => data.clear(),
                    }
                }
                DechunkState::SizeLf => {
                    if data[0] != b'\n' {
                        return Err(());
                    }
                    let _ = data.split_to(1);
                    self.seen_digits = false;
                    if self.chunk_len == 0 {
                        self.state = DechunkState::Trailer;
                    } else {
                        self.state = DechunkState::Body;
                    }
                }
                DechunkState::Body => {
                    let take = self.chunk_len.min(data.len() as u64) as usize;
                    out.push(data.split_to(take));
                    self.chunk_len -= take as u64;
                    if self.chunk_len == 0 {
                        self.state = DechunkState::BodyCr;
                    }
                }
                DechunkState::BodyCr => {
                    if data[0] != b'\r' {
                        return Err(());
                    }
                    let _ = data.split_to(1);
                    self.state = DechunkState::BodyLf;
                }
                DechunkState::BodyLf => {
                    if data[0] != b'\n' {
                        return Err(());
                    }
                    let _ = data.split_to(1);
                    self.state = DechunkState::Size;
                }
                DechunkState::Trailer => {
                    if data[0] == b'\r' {
                        let _ = data.split_to(1);
                        self.state = DechunkState::TrailerLf;
                    } else {
                        self.state = DechunkState::TrailerLine;
                    }
                }
                DechunkState::TrailerLine => {
                    match data.iter().position(|&b| b == b'\n') {
                        Some(at) => {
                            let _ = data.split_to(at + 1);
                            self.state = DechunkState::Trailer;
                        }
                        None => data.clear(),
                    }
                }
                DechunkState::TrailerLf => {
                    if data[0] != b'\n' {
                        return Err(());
                    }
                    let _ = data.split_to(1);
                    self.state = DechunkState::Done;
                    return Ok(Dechunked::Done { leftover: data });
                }
                DechunkState::Done => {
                    return Ok(Dechunked::Done { leftover: data });
                }
            }
        }
        if self.state == DechunkState::Done {
            Ok(Dechunked::Done {
                leftover: Bytes::new(),
            })
        } else {
            Ok(Dechunked::NeedMore)
        }
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Vec<u8>, bool) {
        let mut dechunker = Dechunker::new();
        let mut out = Vec::new();
        let outcome = dechunker
            .decode(Bytes::copy_from_slice(input), &mut out)
            .expect("valid chunked input");
        let body: Vec<u8> = out.iter().flat_map(|b| b.to_vec()).collect();
        (body, matches!(outcome, Dechunked::Done { .. }))
    }

    #[test]
    fn decodes_simple_body() {
        let (body, done) = decode_all(b"5\r\nhello\r\n0\r\n\r\n");
        assert_eq!(body, b"hello");
        assert!(done);
    }

    #[test]
    fn decodes_across_feeds() {
        let mut dechunker = Dechunker::new();
        let mut out = Vec::new();
        let outcome = dechunker
            .decode(Bytes::from_static(b"5\r\nhe"), &mut out)
            .expect("valid prefix");
        assert!(matches!(outcome, Dechunked::NeedMore));
        let outcome = dechunker
            .decode(Bytes::from_static(b"llo\r\n0\r\n\r\n"), &mut out)
            .expect("valid suffix");
        assert!(matches!(outcome, Dechunked::Done { .. }));
        let body: Vec<u8> = out.iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn reports_leftover_bytes() {
        let mut dechunker = Dechunker::new();
        let mut out = Vec::new();
        match dechunker
            .decode(Bytes::from_static(b"2\r\nok\r\n0\r\n\r\nGET /next"), &mut out)
            .expect("valid input")
        {
            Dechunked::Done { leftover } => assert_eq!(leftover.as_ref(), b"GET /next"),
            Dechunked::NeedMore => panic!("expected completion"),
        }
    }

    #[test]
    fn skips_extensions_and_trailers() {
        let (body, done) = decode_all(b"3;ext=1\r\nabc\r\n0\r\nX-Done: yes\r\n\r\n");
        assert_eq!(body, b"abc");
        assert!(done);
    }

    #[test]
    fn rejects_bad_size_line() {
        let mut dechunker = Dechunker::new();
        let mut out = Vec::new();
        assert!(dechunker
            .decode(Bytes::from_static(b"zz\r\n"), &mut out)
            .is_err());
    }

    #[test]
    fn frames_payloads() {
        let framed = frame(Bytes::from_static(b"hello"));
        assert_eq!(framed.as_ref(), b"5\r\nhello\r\n");
    }
}
