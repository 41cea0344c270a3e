//! Cached date strings.
//!
//! Formatting an HTTP date is expensive enough to matter on hot paths, so
//! the engine renders the `Date` and `Expires` values at most once per
//! second and hands out owned snapshots. Readers always observe a complete,
//! valid string.

use std::time::{Duration, Instant, SystemTime};

use http::header::HeaderValue;

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

const EXPIRES_AHEAD: Duration = Duration::from_secs(86_400);

#[derive(Debug)]
pub(crate) struct DateCache {
    updated: Option<Instant>,
    current: HeaderValue,
    expires: HeaderValue,
}

impl DateCache {
    pub(crate) fn new() -> DateCache {
        let mut cache = DateCache {
            updated: None,
            current: HeaderValue::from_static(""),
            expires: HeaderValue::from_static(""),
        };
        cache.render(SystemTime::now());
        cache
    }

    /// Re-render the strings if the last render is a second or more old.
    pub(crate) fn refresh(&mut self, now: Instant) {
        match self.updated {
            Some(updated) if now.duration_since(updated) < Duration::from_secs(1) => {}
            _ => {
                self.render(SystemTime::now());
                self.updated = Some(now);
            }
        }
    }

    pub(crate) fn current(&self) -> HeaderValue {
        self.current.clone()
    }

    pub(crate) fn expires(&self) -> HeaderValue {
        self.expires.clone()
    }

    fn render(&mut self, when: SystemTime) {
        self.current = header_date(when);
        self.expires = header_date(when + EXPIRES_AHEAD);
        debug_assert_eq!(self.current.len(), DATE_VALUE_LENGTH);
    }
}

/// Format a timestamp in the HTTP date format.
pub(crate) fn header_date(when: SystemTime) -> HeaderValue {
    HeaderValue::from_str(&httpdate::fmt_http_date(when))
        .expect("formatted date is a valid header value")
}
