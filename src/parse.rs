//! Default parser collaborator.
//!
//! The engine core treats parsing as an external concern; this module is
//! the crate's stock implementation of that seam, built on `httparse`. It
//! consumes buffered transport bytes, populates the RX context, drives the
//! First → Parsed → Content transitions, and feeds body bytes into the
//! receive chain.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;

use crate::conn::{Conn, Fault, Rx, State, Tx};
use crate::error::{Error, Payload, Result};
use crate::packet::Packet;
use crate::pipeline;

pub(crate) struct ParseState {
    pub(crate) buf: BytesMut,
}

impl ParseState {
    pub(crate) fn new() -> ParseState {
        ParseState {
            buf: BytesMut::new(),
        }
    }
}

enum Head {
    Incomplete,
    TooManyHeaders,
    Bad,
    Request {
        consumed: usize,
        method: Method,
        uri: String,
        minor: u8,
        headers: HeaderMap,
    },
    Response {
        consumed: usize,
        status: u16,
        headers: HeaderMap,
    },
}

impl Conn {
    /// Feed received bytes to the engine.
    ///
    /// Bytes are buffered, the head is parsed once complete, and body bytes
    /// flow into the receive pipeline. Keep-alive connections that have
    /// completed a request are reset transparently when the next request's
    /// bytes arrive.
    pub fn input(&mut self, data: &[u8]) -> Result<()> {
        match self.timeout {
            Some(crate::conn::TimeoutReason::Shutdown) => return Err(Error::new_shutdown()),
            Some(reason) => {
                let which = match reason {
                    crate::conn::TimeoutReason::Parse => crate::error::Timeout::Parse,
                    crate::conn::TimeoutReason::Inactivity => crate::error::Timeout::Inactivity,
                    _ => crate::error::Timeout::Request,
                };
                return Err(Error::new_timeout(which));
            }
            None => {}
        }
        if self.disconnected || self.conn_error {
            return Err(Error::new_comms_severed("connection is closed"));
        }
        self.touch();
        self.parse.buf.extend_from_slice(data);
        self.advance_input()
    }

    /// Return unconsumed bytes to the front of the input buffer.
    ///
    /// Used by the chunk filter when a terminating chunk leaves pipelined
    /// bytes behind it.
    pub(crate) fn unread_input(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut buf = BytesMut::with_capacity(data.len() + self.parse.buf.len());
        buf.extend_from_slice(&data);
        buf.extend_from_slice(&self.parse.buf);
        self.parse.buf = buf;
    }

    fn advance_input(&mut self) -> Result<()> {
        loop {
            match self.state() {
                // First without an RX context means the head is still
                // arriving (only the request line has been seen).
                State::Begin | State::Connected | State::First if self.rx.is_none() => {
                    if self.parse.buf.is_empty() {
                        return Ok(());
                    }
                    let done = if self.endpoint {
                        self.parse_request_head()?
                    } else {
                        self.parse_response_head()?
                    };
                    if !done {
                        return Ok(());
                    }
                }
                State::Content => {
                    if !self.feed_body()? {
                        return Ok(());
                    }
                }
                State::Complete => {
                    if self.parse.buf.is_empty() {
                        return Ok(());
                    }
                    if !self.prepare_next_request() {
                        self.parse.buf.clear();
                        return Ok(());
                    }
                }
                // Mid-response states: pipelined bytes wait their turn.
                _ => return Ok(()),
            }
        }
    }

    fn parse_request_head(&mut self) -> Result<bool> {
        if !self.check_head_size()? {
            return Ok(false);
        }
        let head = {
            let buf = &self.parse.buf[..];
            let mut slots = vec![httparse::EMPTY_HEADER; self.limits.header_count];
            let mut req = httparse::Request::new(&mut slots);
            match req.parse(buf) {
                Ok(httparse::Status::Complete(consumed)) => {
                    match owned_request_head(&req, consumed) {
                        Some(head) => head,
                        None => Head::Bad,
                    }
                }
                Ok(httparse::Status::Partial) => Head::Incomplete,
                Err(httparse::Error::TooManyHeaders) => Head::TooManyHeaders,
                Err(_) => Head::Bad,
            }
        };
        match head {
            Head::Incomplete => {
                // The request line alone advances the state so the parse
                // timeout can distinguish a slow head from a silent peer.
                if self.state() < State::First
                    && find_line_end(&self.parse.buf).is_some()
                {
                    self.set_state(State::First);
                }
                Ok(false)
            }
            Head::TooManyHeaders => {
                let limit = self.limits.header_count;
                self.error(
                    Fault::close(413),
                    format!("Request has too many headers, exceeds limit of {}", limit),
                );
                Err(Error::new_too_large(Payload::Headers))
            }
            Head::Bad => {
                self.error(Fault::close(400), "Bad request header");
                Err(Error::new_bad_request())
            }
            Head::Request {
                consumed,
                method,
                uri,
                minor,
                headers,
            } => {
                if uri.len() > self.limits.uri_size {
                    let limit = self.limits.uri_size;
                    self.error(
                        Fault::close(414),
                        format!(
                            "Request URI of {} bytes exceeds limit of {}",
                            uri.len(),
                            limit
                        ),
                    );
                    return Err(Error::new_too_large(Payload::Uri));
                }
                let _ = self.parse.buf.split_to(consumed);
                self.process_request_head(method, uri, minor, headers)?;
                Ok(true)
            }
            Head::Response { .. } => Ok(false),
        }
    }

    fn parse_response_head(&mut self) -> Result<bool> {
        if !self.check_head_size()? {
            return Ok(false);
        }
        let head = {
            let buf = &self.parse.buf[..];
            let mut slots = vec![httparse::EMPTY_HEADER; self.limits.header_count];
            let mut res = httparse::Response::new(&mut slots);
            match res.parse(buf) {
                Ok(httparse::Status::Complete(consumed)) => {
                    match owned_response_head(&res, consumed) {
                        Some(head) => head,
                        None => Head::Bad,
                    }
                }
                Ok(httparse::Status::Partial) => Head::Incomplete,
                Err(httparse::Error::TooManyHeaders) => Head::TooManyHeaders,
                Err(_) => Head::Bad,
            }
        };
        match head {
            Head::Incomplete => Ok(false),
            Head::TooManyHeaders | Head::Bad => {
                self.error(Fault::abort(502), "Cannot parse response from server");
                Err(Error::new_upstream())
            }
            Head::Response {
                consumed,
                status,
                headers,
            } => {
                let _ = self.parse.buf.split_to(consumed);
                self.process_response_head(status, headers)?;
                Ok(true)
            }
            Head::Request { .. } => Ok(false),
        }
    }

    /// Reject heads that exceed the header size limit before they complete.
    fn check_head_size(&mut self) -> Result<bool> {
        let complete = find_head_end(&self.parse.buf).is_some();
        if !complete && self.parse.buf.len() > self.limits.header_size {
            if self.endpoint {
                let size = self.parse.buf.len();
                let limit = self.limits.header_size;
                self.error(
                    Fault::close(413),
                    format!(
                        "Request header of {} bytes exceeds limit of {}",
                        size, limit
                    ),
                );
                return Err(Error::new_too_large(Payload::Headers));
            }
            self.error(Fault::abort(502), "Response header is too large");
            return Err(Error::new_upstream());
        }
        Ok(true)
    }

    fn process_request_head(
        &mut self,
        method: Method,
        uri: String,
        minor: u8,
        headers: HeaderMap,
    ) -> Result<()> {
        let mut rx = Rx::new();
        let mut tx = Tx::new(self.limits.chunk_size);
        tx.ext = uri_extension(&uri).map(str::to_string);

        // Keep-alive only holds for 1.1, or an explicit 1.0 opt-in, and is
        // always revocable by Connection: close.
        let wants_close = header_token(&headers, http::header::CONNECTION, "close");
        let wants_keep = header_token(&headers, http::header::CONNECTION, "keep-alive");
        if wants_close || (minor == 0 && !wants_keep) {
            self.keep_alive_count = 0;
        }

        rx.chunked = header_token(&headers, http::header::TRANSFER_ENCODING, "chunked");
        let content_length = match parse_content_length(&headers) {
            Ok(len) => len,
            Err(()) => {
                self.error(Fault::close(400), "Bad Content-Length header");
                return Err(Error::new_bad_request());
            }
        };
        if let Some(len) = content_length {
            if len > self.limits.receive_body_size {
                let limit = self.limits.receive_body_size;
                self.error(
                    Fault::close(413),
                    format!(
                        "Request content length {} bytes is too big, limit {}",
                        len, limit
                    ),
                );
                return Err(Error::new_too_large(Payload::Body));
            }
            rx.remaining_content = len;
        }
        rx.method = method;
        rx.uri = uri;
        rx.headers = headers;
        rx.need_input_pipeline = rx.chunked || rx.remaining_content > 0;
        if !rx.need_input_pipeline {
            rx.eof = true;
        }
        self.rx = Some(rx);
        self.tx = Some(tx);
        self.set_state(State::First);

        let route = {
            let router = self.engine.router();
            let rx = self.rx.as_ref().expect("rx was just installed");
            router.route(rx)
        };
        if let Some(rx) = self.rx.as_mut() {
            rx.route = Some(route.clone());
        }

        if let Some(name) = route.handler.as_deref() {
            match self.engine.lookup_stage(name) {
                Some(stage) => {
                    if let Some(tx) = self.tx.as_mut() {
                        tx.handler = Some(stage);
                    }
                }
                None => {
                    self.error(
                        Fault::status(500),
                        format_args!("Cannot find handler \"{}\"", name),
                    );
                    return Ok(());
                }
            }
        }
        self.set_state(State::Parsed);

        if let Some(realm) = route.auth_realm.clone() {
            if !self.authenticate(&realm) {
                return Ok(());
            }
        }

        if self
            .rx
            .as_ref()
            .map_or(false, |rx| rx.need_input_pipeline)
        {
            pipeline::create_rx_pipeline(self, &route);
        }
        pipeline::create_tx_pipeline(self, &route);
        pipeline::start_pipeline(self);
        if self.error {
            return Ok(());
        }
        if self.rx.as_ref().map_or(true, |rx| rx.eof) {
            self.transition_ready();
        } else {
            self.set_state(State::Content);
        }
        Ok(())
    }

    fn authenticate(&mut self, realm: &str) -> bool {
        let challenge = format!("Basic realm=\"{}\"", realm);
        let denied = match self.credentials.clone() {
            None => Some("Access Denied. Login required".to_string()),
            Some((user, password)) => {
                match self.engine.validate_cred(realm, &user, &password, None) {
                    Ok(()) => None,
                    Err(err) => Some(format!("Access Denied. {}", err)),
                }
            }
        };
        match denied {
            None => true,
            Some(msg) => {
                if let Some(tx) = self.tx.as_mut() {
                    if let Ok(value) = HeaderValue::from_str(&challenge) {
                        tx.headers.insert(http::header::WWW_AUTHENTICATE, value);
                    }
                }
                self.error(Fault::status(401), msg);
                false
            }
        }
    }

    fn process_response_head(&mut self, status: u16, headers: HeaderMap) -> Result<()> {
        let mut rx = Rx::new();
        rx.status = status;
        rx.uri = self.tx.as_ref().map(|tx| tx.uri.clone()).unwrap_or_default();
        rx.chunked = header_token(&headers, http::header::TRANSFER_ENCODING, "chunked");
        let content_length = match parse_content_length(&headers) {
            Ok(len) => len,
            Err(()) => {
                self.error(Fault::abort(502), "Bad Content-Length in response");
                return Err(Error::new_upstream());
            }
        };
        match content_length {
            Some(len) => rx.remaining_content = len,
            None if rx.chunked => {}
            None => rx.until_close = true,
        }
        rx.headers = headers;
        rx.need_input_pipeline = true;
        self.rx = Some(rx);
        self.set_state(State::First);
        self.set_state(State::Parsed);

        let route = self.engine.client_route();
        pipeline::create_rx_pipeline(self, &route);

        let no_body = self.rx.as_ref().map_or(true, |rx| {
            rx.remaining_content == 0 && !rx.chunked && !rx.until_close
        });
        if no_body {
            self.rx_body_complete();
        } else {
            self.set_state(State::Content);
        }
        Ok(())
    }

    /// Move buffered body bytes into the receive chain. Returns true when
    /// the request body is complete and the loop should continue.
    fn feed_body(&mut self) -> Result<bool> {
        if self.parse.buf.is_empty() {
            return Ok(false);
        }
        let (chunked, until_close) = self
            .rx
            .as_ref()
            .map(|rx| (rx.chunked, rx.until_close))
            .unwrap_or((false, false));
        if chunked || until_close {
            let data = self.parse.buf.split().freeze();
            self.put_rx_packet(Packet::data(data));
            pipeline::service_queues(self);
            return Ok(self.state() != State::Content);
        }

        let remaining = self
            .rx
            .as_ref()
            .map(|rx| rx.remaining_content)
            .unwrap_or(0);
        let n = remaining.min(self.parse.buf.len() as u64) as usize;
        let data = self.parse.buf.split_to(n).freeze();
        if let Some(rx) = self.rx.as_mut() {
            rx.remaining_content -= n as u64;
        }
        self.put_rx_packet(Packet::data(data));
        pipeline::service_queues(self);
        if self.error {
            return Ok(false);
        }
        let done = self
            .rx
            .as_ref()
            .map_or(true, |rx| rx.remaining_content == 0);
        if done {
            self.put_rx_packet(Packet::end());
            self.rx_body_complete();
        }
        Ok(done)
    }

    /// Hand a packet to the first stage of the receive chain.
    pub(crate) fn put_rx_packet(&mut self, packet: Packet) {
        let head = pipeline::rx_head(self);
        let first = self.queues.next(head);
        if first == head {
            return;
        }
        let stage = self.queues.get(first).stage.clone();
        stage.incoming(self, first, packet);
    }
}

fn owned_request_head(req: &httparse::Request<'_, '_>, consumed: usize) -> Option<Head> {
    let method = Method::from_bytes(req.method?.as_bytes()).ok()?;
    let uri = req.path?.to_string();
    let minor = req.version?;
    let headers = owned_headers(req.headers)?;
    Some(Head::Request {
        consumed,
        method,
        uri,
        minor,
        headers,
    })
}

fn owned_response_head(res: &httparse::Response<'_, '_>, consumed: usize) -> Option<Head> {
    let status = res.code?;
    let headers = owned_headers(res.headers)?;
    Some(Head::Response {
        consumed,
        status,
        headers,
    })
}

fn owned_headers(raw: &[httparse::Header<'_>]) -> Option<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes()).ok()?;
        let value = HeaderValue::from_bytes(header.value).ok()?;
        headers.append(name, value);
    }
    Some(headers)
}

fn parse_content_length(headers: &HeaderMap) -> std::result::Result<Option<u64>, ()> {
    match headers.get(http::header::CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or(()),
    }
}

/// Case-insensitive token membership in a comma-separated header value.
fn header_token(headers: &HeaderMap, name: http::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

/// The file extension of a URI path, if it has one.
fn uri_extension(uri: &str) -> Option<&str> {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let segment = path.rsplit('/').next().unwrap_or(path);
    match segment.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\n"), Some(14));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn uri_extensions() {
        assert_eq!(uri_extension("/index.html"), Some("html"));
        assert_eq!(uri_extension("/a/b.c/d.txt?x=1"), Some("txt"));
        assert_eq!(uri_extension("/plain"), None);
        assert_eq!(uri_extension("/.hidden"), None);
    }

    #[test]
    fn content_length_values() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_content_length(&headers), Ok(None));
        headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_static("42"),
        );
        assert_eq!(parse_content_length(&headers), Ok(Some(42)));
        headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_static("nope"),
        );
        assert_eq!(parse_content_length(&headers), Err(()));
    }

    #[test]
    fn header_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONNECTION,
            HeaderValue::from_static("Keep-Alive, Upgrade"),
        );
        assert!(header_token(
            &headers,
            http::header::CONNECTION,
            "keep-alive"
        ));
        assert!(!header_token(&headers, http::header::CONNECTION, "close"));
    }
}
