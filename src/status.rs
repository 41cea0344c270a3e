//! Status code catalog.
//!
//! A fixed table mapping numeric status codes to reason phrases. Besides the
//! standard HTTP/1.1 codes, two proprietary codes are used internally when
//! the peer connection is severed mid-response: `550 Comms Error` and
//! `551 General Client Error`.

/// Status raised internally when the transport to the peer is severed.
pub const COMMS_ERROR: u16 = 550;

/// Status raised internally for client failures with no wire counterpart.
pub const GENERAL_CLIENT_ERROR: u16 = 551;

/// One catalog row: numeric code, three-digit key, reason phrase.
///
/// The key string is what gets written into the status line, so it is kept
/// pre-rendered rather than formatted per response.
#[derive(Debug, Clone, Copy)]
pub struct StatusCode {
    pub(crate) code: u16,
    pub(crate) key: &'static str,
    pub(crate) reason: &'static str,
}

// Ordered by code so lookup can binary-search.
static STATUS_CODES: &[StatusCode] = &[
    StatusCode { code: 100, key: "100", reason: "Continue" },
    StatusCode { code: 101, key: "101", reason: "Switching Protocols" },
    StatusCode { code: 200, key: "200", reason: "OK" },
    StatusCode { code: 201, key: "201", reason: "Created" },
    StatusCode { code: 202, key: "202", reason: "Accepted" },
    StatusCode { code: 204, key: "204", reason: "No Content" },
    StatusCode { code: 205, key: "205", reason: "Reset Content" },
    StatusCode { code: 206, key: "206", reason: "Partial Content" },
    StatusCode { code: 301, key: "301", reason: "Moved Permanently" },
    StatusCode { code: 302, key: "302", reason: "Moved Temporarily" },
    StatusCode { code: 304, key: "304", reason: "Not Modified" },
    StatusCode { code: 305, key: "305", reason: "Use Proxy" },
    StatusCode { code: 307, key: "307", reason: "Temporary Redirect" },
    StatusCode { code: 400, key: "400", reason: "Bad Request" },
    StatusCode { code: 401, key: "401", reason: "Unauthorized" },
    StatusCode { code: 402, key: "402", reason: "Payment Required" },
    StatusCode { code: 403, key: "403", reason: "Forbidden" },
    StatusCode { code: 404, key: "404", reason: "Not Found" },
    StatusCode { code: 405, key: "405", reason: "Method Not Allowed" },
    StatusCode { code: 406, key: "406", reason: "Not Acceptable" },
    StatusCode { code: 408, key: "408", reason: "Request Timeout" },
    StatusCode { code: 409, key: "409", reason: "Conflict" },
    StatusCode { code: 410, key: "410", reason: "Gone" },
    StatusCode { code: 411, key: "411", reason: "Length Required" },
    StatusCode { code: 412, key: "412", reason: "Precondition Failed" },
    StatusCode { code: 413, key: "413", reason: "Request Entity Too Large" },
    StatusCode { code: 414, key: "414", reason: "Request-URI Too Large" },
    StatusCode { code: 415, key: "415", reason: "Unsupported Media Type" },
    StatusCode { code: 416, key: "416", reason: "Requested Range Not Satisfiable" },
    StatusCode { code: 417, key: "417", reason: "Expectation Failed" },
    StatusCode { code: 500, key: "500", reason: "Internal Server Error" },
    StatusCode { code: 501, key: "501", reason: "Not Implemented" },
    StatusCode { code: 502, key: "502", reason: "Bad Gateway" },
    StatusCode { code: 503, key: "503", reason: "Service Unavailable" },
    StatusCode { code: 504, key: "504", reason: "Gateway Timeout" },
    StatusCode { code: 505, key: "505", reason: "Http Version Not Supported" },
    StatusCode { code: 507, key: "507", reason: "Insufficient Storage" },
    StatusCode { code: COMMS_ERROR, key: "550", reason: "Comms Error" },
    StatusCode { code: GENERAL_CLIENT_ERROR, key: "551", reason: "General Client Error" },
];

/// Look up the reason phrase for a status code.
///
/// Returns `"Custom error"` for codes not in the catalog.
pub fn reason(code: u16) -> &'static str {
    lookup(code).map(|sc| sc.reason).unwrap_or("Custom error")
}

/// The pre-rendered three-digit key for a cataloged code, if any.
pub(crate) fn key(code: u16) -> Option<&'static str> {
    lookup(code).map(|sc| sc.key)
}

fn lookup(code: u16) -> Option<&'static StatusCode> {
    STATUS_CODES
        .binary_search_by_key(&code, |sc| sc.code)
        .ok()
        .map(|idx| &STATUS_CODES[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_codes() {
        assert_eq!(reason(200), "OK");
        assert_eq!(reason(404), "Not Found");
        assert_eq!(reason(408), "Request Timeout");
        assert_eq!(reason(505), "Http Version Not Supported");
    }

    #[test]
    fn proprietary_codes() {
        assert_eq!(reason(COMMS_ERROR), "Comms Error");
        assert_eq!(reason(GENERAL_CLIENT_ERROR), "General Client Error");
    }

    #[test]
    fn unknown_code_is_custom() {
        assert_eq!(reason(299), "Custom error");
        assert_eq!(reason(999), "Custom error");
    }

    #[test]
    fn table_is_sorted() {
        for pair in STATUS_CODES.windows(2) {
            assert!(pair[0].code < pair[1].code);
        }
    }
}
