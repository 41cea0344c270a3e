//! The byte transport seam.
//!
//! The engine never touches sockets directly. A [`Transport`] is whatever
//! the embedding application hands it: a TCP stream, a TLS session, or a
//! test double. All I/O at this boundary is strictly non-blocking; a
//! transport signals "try again later" with [`io::ErrorKind::WouldBlock`].

use std::io;
use std::path::Path;

/// A non-blocking byte transport underlying one connection.
///
/// TLS is a drop-in replacement: a secure transport implements the same
/// trait and reports [`Transport::is_secure`].
pub trait Transport: Send {
    /// Write as many bytes as the transport will take, returning the count.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read available bytes into `buf`, returning `(count, eof)`.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, bool)>;

    /// Sever the transport. Further sends and recvs fail.
    fn disconnect(&mut self);

    /// Whether the transport is encrypted.
    fn is_secure(&self) -> bool {
        false
    }

    /// Transmit a file region directly, bypassing user-space buffering.
    ///
    /// Transports without kernel support return `Unsupported`; the send
    /// connector falls back to the buffered write path.
    fn sendfile(&mut self, _path: &Path, _offset: u64, _len: u64) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport cannot send files directly",
        ))
    }
}
