#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use brazier::Transport;

#[derive(Default)]
struct Shared {
    written: Vec<u8>,
    recv: VecDeque<u8>,
    eof: bool,
    disconnected: bool,
    block_writes: bool,
}

/// Test-side view of a [`mock_transport`] wire.
#[derive(Clone)]
pub struct Wire {
    shared: Arc<Mutex<Shared>>,
}

impl Wire {
    pub fn written(&self) -> Vec<u8> {
        self.shared.lock().unwrap().written.clone()
    }

    pub fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    pub fn written_len(&self) -> usize {
        self.shared.lock().unwrap().written.len()
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.lock().unwrap().disconnected
    }

    /// Queue bytes for the connection to read via `readable_event`.
    pub fn push_recv(&self, data: &[u8]) {
        self.shared.lock().unwrap().recv.extend(data.iter().copied());
    }

    /// Signal peer EOF on the next read.
    pub fn close_peer(&self) {
        self.shared.lock().unwrap().eof = true;
    }

    /// Make sends report would-block until unblocked.
    pub fn set_blocked(&self, blocked: bool) {
        self.shared.lock().unwrap().block_writes = blocked;
    }
}

struct MockTransport {
    shared: Arc<Mutex<Shared>>,
}

impl Transport for MockTransport {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.shared.lock().unwrap();
        if shared.disconnected {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if shared.block_writes {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        shared.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, bool)> {
        let mut shared = self.shared.lock().unwrap();
        if shared.disconnected {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if shared.recv.is_empty() {
            if shared.eof {
                return Ok((0, true));
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let mut n = 0;
        while n < buf.len() {
            match shared.recv.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        let eof = shared.recv.is_empty() && shared.eof;
        Ok((n, eof))
    }

    fn disconnect(&mut self) {
        self.shared.lock().unwrap().disconnected = true;
    }
}

/// A mocked transport plus its test-side handle.
pub fn mock_transport() -> (Box<dyn Transport>, Wire) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    (
        Box::new(MockTransport {
            shared: shared.clone(),
        }),
        Wire { shared },
    )
}
