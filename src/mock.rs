//! Mocked transport for in-crate tests.

use std::io;
use std::sync::{Arc, Mutex};

use crate::transport::Transport;

#[derive(Default)]
pub(crate) struct MockState {
    pub(crate) written: Vec<u8>,
    pub(crate) disconnected: bool,
}

pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn pair() -> (Box<dyn Transport>, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Box::new(MockTransport {
                state: state.clone(),
            }),
            state,
        )
    }
}

impl Transport for MockTransport {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.disconnected {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn recv(&mut self, _buf: &mut [u8]) -> io::Result<(usize, bool)> {
        Err(io::Error::from(io::ErrorKind::WouldBlock))
    }

    fn disconnect(&mut self) {
        self.state.lock().unwrap().disconnected = true;
    }
}
