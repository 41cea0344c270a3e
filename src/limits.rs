//! Connection and request limits.
//!
//! A `Limits` bundle is attached to every connection and is immutable from
//! then on. Timeout fields use [`Duration::ZERO`] as the "unlimited"
//! sentinel; size and count fields are always finite except on the client
//! side, where body limits default to the maximum representable value.

use std::time::Duration;

const MAX_CHUNK: usize = 8 * 1024;
const MAX_QBUFFER: usize = 8 * 1024;
const MAX_NUM_HEADERS: usize = 64;
const MAX_HEADERS: usize = 8 * 1024;
const MAX_RECEIVE_FORM: u64 = 1024 * 1024;
const MAX_RECEIVE_BODY: u64 = 4 * 1024 * 1024;
const MAX_TX_BODY: u64 = 8 * 1024 * 1024;
const MAX_UPLOAD: u64 = 64 * 1024 * 1024;
const MAX_URI: usize = 1024;
const MAX_KEEP_ALIVE: u32 = 100;
const MAX_REQUESTS_PER_CLIENT: u32 = 20;
const MAX_CLIENTS: u32 = 32;
const MAX_CONNECTIONS: u32 = 256;
const MAX_SESSIONS: u32 = 100;

const INACTIVITY_DURATION: Duration = Duration::from_secs(30);
const REQUEST_DURATION: Duration = Duration::from_secs(10 * 60);
const PARSE_DURATION: Duration = Duration::from_secs(10);
const SESSION_DURATION: Duration = Duration::from_secs(30 * 60);

/// Tunable limits for one connection.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum chunk size used by the chunk filter for outgoing data.
    pub chunk_size: usize,
    /// Stage queue buffering threshold.
    pub buffer_size: usize,
    /// Maximum number of request headers.
    pub header_count: usize,
    /// Maximum total size of the request head in bytes.
    pub header_size: usize,
    /// Maximum size of an incoming form body.
    pub receive_form_size: u64,
    /// Maximum size of an incoming request body.
    pub receive_body_size: u64,
    /// Maximum size of an outgoing response body.
    pub transmission_body_size: u64,
    /// Maximum size of an upload body.
    pub upload_size: u64,
    /// Maximum URI length in bytes.
    pub uri_size: usize,
    /// Permitted request/response cycles on one connection.
    pub keep_alive_max: u32,
    /// Maximum requests accepted from a single client address.
    pub requests_per_client_max: u32,
    /// Maximum simultaneous client addresses.
    pub client_max: u32,
    /// Maximum simultaneous connections.
    pub connections_max: u32,
    /// Maximum concurrent sessions.
    pub session_max: u32,
    /// Abort a connection idle for longer than this. Zero means unlimited.
    pub inactivity_timeout: Duration,
    /// Abort a request running for longer than this. Zero means unlimited.
    pub request_timeout: Duration,
    /// Abort a request whose headers take longer than this to arrive.
    /// Zero means unlimited.
    pub request_parse_timeout: Duration,
    /// Expire sessions idle for longer than this. Zero means unlimited.
    pub session_timeout: Duration,
}

impl Limits {
    /// Defaulted limits for the given role.
    ///
    /// The client side must never refuse what a server chooses to send, so
    /// its body size fields start at the maximum representable value.
    pub fn new(server_side: bool) -> Limits {
        let mut limits = Limits {
            chunk_size: MAX_CHUNK,
            buffer_size: MAX_QBUFFER,
            header_count: MAX_NUM_HEADERS,
            header_size: MAX_HEADERS,
            receive_form_size: MAX_RECEIVE_FORM,
            receive_body_size: MAX_RECEIVE_BODY,
            transmission_body_size: MAX_TX_BODY,
            upload_size: MAX_UPLOAD,
            uri_size: MAX_URI,
            keep_alive_max: MAX_KEEP_ALIVE,
            requests_per_client_max: MAX_REQUESTS_PER_CLIENT,
            client_max: MAX_CLIENTS,
            connections_max: MAX_CONNECTIONS,
            session_max: MAX_SESSIONS,
            inactivity_timeout: INACTIVITY_DURATION,
            request_timeout: REQUEST_DURATION,
            request_parse_timeout: PARSE_DURATION,
            session_timeout: SESSION_DURATION,
        };
        if !server_side {
            limits.ease();
        }
        limits
    }

    /// Server-side defaults.
    pub fn server() -> Limits {
        Limits::new(true)
    }

    /// Client-side defaults.
    pub fn client() -> Limits {
        Limits::new(false)
    }

    /// Remove the body size restrictions.
    pub fn ease(&mut self) {
        self.receive_form_size = u64::MAX;
        self.receive_body_size = u64::MAX;
        self.transmission_body_size = u64::MAX;
        self.upload_size = u64::MAX;
    }

    /// A timeout with the zero sentinel resolved to "effectively forever".
    pub(crate) fn effective(timeout: Duration) -> Duration {
        if timeout.is_zero() {
            Duration::MAX
        } else {
            timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_are_finite() {
        let limits = Limits::server();
        assert!(limits.receive_body_size < u64::MAX);
        assert!(limits.transmission_body_size < u64::MAX);
        assert!(limits.upload_size < u64::MAX);
        assert!(limits.receive_form_size < u64::MAX);
    }

    #[test]
    fn client_defaults_are_eased() {
        let limits = Limits::client();
        assert_eq!(limits.receive_body_size, u64::MAX);
        assert_eq!(limits.transmission_body_size, u64::MAX);
        assert_eq!(limits.upload_size, u64::MAX);
        assert_eq!(limits.receive_form_size, u64::MAX);
    }

    #[test]
    fn ease_lifts_body_limits_only() {
        let mut limits = Limits::server();
        let headers = limits.header_size;
        limits.ease();
        assert_eq!(limits.receive_body_size, u64::MAX);
        assert_eq!(limits.header_size, headers);
    }

    #[test]
    fn zero_timeout_means_unlimited() {
        assert_eq!(Limits::effective(Duration::ZERO), Duration::MAX);
        let t = Duration::from_secs(30);
        assert_eq!(Limits::effective(t), t);
    }
}
