//! Engine-level behavior: registries, auth, caching, and the client role.

mod support;

use std::sync::Arc;

use bytes::Bytes;
use brazier::{
    reason, ConfigBackend, Engine, FixedRouter, Limits, Method, Route, State,
};
use support::mock_transport;

fn engine_with_route(route: Route) -> Engine {
    let engine = Engine::new();
    engine.set_router(Arc::new(FixedRouter::new(route)));
    engine
}

#[test]
fn status_catalog_is_exposed() {
    assert_eq!(reason(200), "OK");
    assert_eq!(reason(550), "Comms Error");
    assert_eq!(reason(551), "General Client Error");
    assert_eq!(reason(299), "Custom error");
}

#[test]
fn missing_credentials_get_challenged() {
    let engine = engine_with_route(Route::new().with_auth_realm("vault"));
    let (transport, wire) = mock_transport();
    let conn = engine.accept(transport).unwrap();
    conn.lock()
        .unwrap()
        .input(b"GET /secret HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let out = wire.written_str();
    assert!(out.starts_with("HTTP/1.1 401 Unauthorized\r\n"), "{out}");
    assert!(
        out.contains("www-authenticate: Basic realm=\"vault\"")
            || out.contains("WWW-Authenticate: Basic realm=\"vault\""),
        "{out}"
    );
}

#[test]
fn configured_backend_validates_credentials() {
    let backend = ConfigBackend::new();
    backend.add_user("vault", "ace", "secret");
    let engine = engine_with_route(Route::new().with_auth_realm("vault"));
    engine.register_auth_backend("config", Arc::new(backend));
    assert!(engine.set_auth_backend("config"));

    // Good credentials pass through to the handler.
    let (transport, wire) = mock_transport();
    let conn = engine.accept(transport).unwrap();
    {
        let mut conn = conn.lock().unwrap();
        conn.set_credentials("ace", "secret");
        conn.input(b"GET /secret HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    }
    assert!(wire.written_str().starts_with("HTTP/1.1 200 OK\r\n"));

    // Bad credentials are refused.
    let (transport, wire) = mock_transport();
    let conn = engine.accept(transport).unwrap();
    {
        let mut conn = conn.lock().unwrap();
        conn.set_credentials("ace", "wrong");
        conn.input(b"GET /secret HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    }
    assert!(wire.written_str().starts_with("HTTP/1.1 401 Unauthorized\r\n"));
}

#[test]
fn no_backend_fails_closed_with_the_canonical_message() {
    let engine = engine_with_route(Route::new().with_auth_realm("vault"));
    let (transport, _wire) = mock_transport();
    let conn = engine.accept(transport).unwrap();
    let mut conn = conn.lock().unwrap();
    conn.set_credentials("ace", "secret");
    conn.input(b"GET /secret HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    assert!(conn
        .error_message()
        .contains("Required authorization backend method is not enabled or configured"));
}

#[test]
fn cache_handler_serves_recorded_responses() {
    let route = Route {
        handler: Some("cacheHandler".to_string()),
        caching: true,
        ..Route::default()
    };
    let engine = engine_with_route(route);
    engine.cache_response("/c", 200, Bytes::from_static(b"cached!"));
    let (transport, wire) = mock_transport();
    let conn = engine.accept(transport).unwrap();
    conn.lock()
        .unwrap()
        .input(b"GET /c HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let out = wire.written_str();
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
    assert!(out.ends_with("cached!"), "{out}");
}

#[test]
fn custom_stages_can_be_registered_and_routed() {
    use brazier::{Conn, QueueId, Stage, StageKind};

    struct TeapotHandler;

    impl Stage for TeapotHandler {
        fn name(&self) -> &str {
            "teapotHandler"
        }

        fn kind(&self) -> StageKind {
            StageKind::Handler
        }

        fn ready(&self, conn: &mut Conn, _q: QueueId) {
            if let Some(tx) = conn.tx_mut() {
                tx.status = 418;
            }
            conn.finalize();
        }
    }

    let engine = engine_with_route(Route::new().with_handler("teapotHandler"));
    engine.register_stage(Arc::new(TeapotHandler));
    let (transport, wire) = mock_transport();
    let conn = engine.accept(transport).unwrap();
    conn.lock()
        .unwrap()
        .input(b"GET /tea HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    // 418 is not in the catalog, so the reason phrase is the custom one.
    let out = wire.written_str();
    assert!(out.starts_with("HTTP/1.1 418 Custom error\r\n"), "{out}");
}

#[test]
fn file_handler_selects_send_connector_with_fallback() {
    use brazier::{Conn, QueueId, Stage, StageKind};

    struct FileHandler;

    impl Stage for FileHandler {
        fn name(&self) -> &str {
            "fileHandler"
        }

        fn kind(&self) -> StageKind {
            StageKind::Handler
        }

        fn open(&self, conn: &mut Conn, _q: QueueId) {
            let path = std::env::temp_dir().join("brazier-send-test.txt");
            std::fs::write(&path, b"file body").unwrap();
            conn.set_send_file(path).unwrap();
        }

        fn ready(&self, conn: &mut Conn, _q: QueueId) {
            conn.finalize();
        }
    }

    let engine = engine_with_route(Route::new().with_handler("fileHandler"));
    engine.register_stage(Arc::new(FileHandler));
    let (transport, wire) = mock_transport();
    let conn = engine.accept(transport).unwrap();
    conn.lock()
        .unwrap()
        .input(b"GET /f.txt HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    {
        let conn = conn.lock().unwrap();
        let names = conn.tx().unwrap().output_stage_names();
        assert_eq!(names.last().copied(), Some("sendConnector"));
    }
    // The mock transport lacks sendfile, so the connector buffered the
    // file contents instead.
    let out = wire.written_str();
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
    assert!(out.contains("\r\nContent-Length: 9\r\n"), "{out}");
    assert!(out.ends_with("file body"), "{out}");
}

#[test]
fn connection_limit_refuses_accepts() {
    let mut limits = Limits::server();
    limits.connections_max = 1;
    let limits = Arc::new(limits);
    let engine = Engine::new();

    let (transport, _wire) = mock_transport();
    let _held = engine
        .accept_with_limits(transport, limits.clone())
        .unwrap();
    let (transport, _wire) = mock_transport();
    let err = engine.accept_with_limits(transport, limits).unwrap_err();
    assert_eq!(err.status(), 503);
}

#[test]
fn engine_tracks_idleness() {
    let engine = engine_with_route(Route::new());
    assert!(engine.is_idle());
    let (transport, _wire) = mock_transport();
    let conn = engine.accept(transport).unwrap();
    assert_eq!(engine.connection_count(), 1);
    {
        let mut conn = conn.lock().unwrap();
        conn.input(b"GET / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nab")
            .unwrap();
        assert_eq!(conn.state(), State::Content);
    }
    assert!(!engine.is_idle());
    conn.lock().unwrap().input(b"c").unwrap();
    assert!(engine.is_idle());
}

#[test]
fn client_round_trip() {
    let engine = Engine::new();
    let (transport, wire) = mock_transport();
    let conn = engine.connect(transport).unwrap();
    let mut conn = conn.lock().unwrap();
    assert!(!conn.is_server());

    conn.request(Method::GET, "/hello").unwrap();
    conn.finalize();
    let sent = wire.written_str();
    assert!(sent.starts_with("GET /hello HTTP/1.1\r\n"), "{sent}");
    assert!(sent.contains("\r\nHost: 127.0.0.1\r\n"), "{sent}");

    conn.input(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();
    assert_eq!(conn.state(), State::Complete);
    assert_eq!(conn.rx().unwrap().status, 200);
    assert_eq!(conn.read_body().as_ref(), b"hello");
    assert!(!conn.has_error());
}

#[test]
fn client_reads_chunked_response() {
    let engine = Engine::new();
    let (transport, _wire) = mock_transport();
    let conn = engine.connect(transport).unwrap();
    let mut conn = conn.lock().unwrap();
    conn.request(Method::GET, "/stream").unwrap();
    conn.finalize();

    conn.input(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
          3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n",
    )
    .unwrap();
    assert_eq!(conn.state(), State::Complete);
    assert_eq!(conn.read_body().as_ref(), b"abcdef");
}

#[test]
fn severed_client_connection_reports_general_client_error() {
    let engine = Engine::new();
    let (transport, wire) = mock_transport();
    let conn = engine.connect(transport).unwrap();
    let mut conn = conn.lock().unwrap();
    conn.request(Method::GET, "/gone").unwrap();
    conn.finalize();

    // The peer closes before any response bytes arrive.
    wire.close_peer();
    conn.readable_event().unwrap();
    assert!(conn.has_conn_error());
    assert_eq!(conn.rx().unwrap().status, 551);
    assert!(conn
        .error_message()
        .contains("Connection closed before the response was received"));
}

#[test]
fn error_message_falls_back_to_status_phrase() {
    let engine = Engine::new();
    let (transport, _wire) = mock_transport();
    let conn = engine.connect(transport).unwrap();
    let mut conn = conn.lock().unwrap();
    conn.request(Method::GET, "/x").unwrap();
    conn.finalize();
    // Before the exchange starts there is nothing to report.
    assert_eq!(conn.error_message(), "");

    conn.input(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    assert_eq!(conn.error_message(), "Not Found");
}
