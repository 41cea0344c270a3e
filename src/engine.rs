//! The engine: process-wide registry and maintenance owner.
//!
//! An `Engine` is an explicit handle, cheap to clone, owning the active
//! connection set, the stage registry, default limits for both roles, the
//! once-per-second date cache, the authentication backend registry, and the
//! single maintenance timer. One engine per process is typical but nothing
//! requires it.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::header::HeaderValue;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::auth::{AuthBackend, AuthRegistry};
use crate::conn::{Conn, State, TimeoutReason};
use crate::date::DateCache;
use crate::error::{Error, Result};
use crate::limits::Limits;
use crate::route::{FixedRouter, Route, Router};
use crate::stage::{
    ActionHandler, CacheHandler, ChunkFilter, ClientHandler, NetConnector, PassHandler,
    RangeFilter, Registry, SendConnector, Stage, UploadFilter,
};
use crate::transport::Transport;

const TIMER_PERIOD: Duration = Duration::from_secs(1);
const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(30);
const SECRET_BYTES: usize = 32;

/// A shared handle to one connection.
pub type ConnRef = Arc<Mutex<Conn>>;

type ActionFn = dyn Fn(&mut Conn) + Send + Sync;

/// The engine handle. Clones share one underlying service.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    software: Mutex<String>,
    protocol: &'static str,
    secret: String,
    server_limits: Arc<Limits>,
    client_limits: Arc<Limits>,
    stages: RwLock<Registry>,
    pass_handler: Arc<dyn Stage>,
    net_connector: Arc<dyn Stage>,
    send_connector: Arc<dyn Stage>,
    client_handler: Arc<dyn Stage>,
    client_route: Arc<Route>,
    router: RwLock<Arc<dyn Router>>,
    auth: Mutex<AuthRegistry>,
    conns: Mutex<Vec<ConnRef>>,
    total_connections: AtomicU64,
    shutdown: AtomicBool,
    shutdown_at: Mutex<Option<Instant>>,
    exit_timeout: Mutex<Duration>,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    timer_warned: AtomicBool,
    dates: Mutex<DateCache>,
    actions: Mutex<HashMap<String, Arc<ActionFn>>>,
    cache: Mutex<HashMap<String, (u16, Bytes)>>,
    default_client: Mutex<(String, u16)>,
    proxy: Mutex<Option<(String, u16)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

impl Engine {
    /// Create an engine with defaulted limits and the built-in stages.
    pub fn new() -> Engine {
        let pass_handler: Arc<dyn Stage> = Arc::new(PassHandler::new());
        let net_connector: Arc<dyn Stage> = Arc::new(NetConnector::new());
        let send_connector: Arc<dyn Stage> = Arc::new(SendConnector::new());
        let client_handler: Arc<dyn Stage> = Arc::new(ClientHandler::new());

        let mut stages = Registry::new();
        stages.add(net_connector.clone());
        stages.add(send_connector.clone());
        stages.add(Arc::new(RangeFilter::new()));
        stages.add(Arc::new(ChunkFilter::new()));
        stages.add(Arc::new(UploadFilter::new()));
        stages.add(pass_handler.clone());
        stages.add(Arc::new(CacheHandler::new()));
        stages.add(Arc::new(ActionHandler::new()));
        stages.add(client_handler.clone());

        let client_route = Arc::new(Route {
            handler: Some("client".to_string()),
            input_stages: vec!["chunkFilter".to_string()],
            output_stages: vec!["chunkFilter".to_string()],
            ..Route::default()
        });

        let router: Arc<dyn Router> = Arc::new(FixedRouter::new(Route::standard()));

        Engine {
            inner: Arc::new(Inner {
                software: Mutex::new(format!("brazier/{}", env!("CARGO_PKG_VERSION"))),
                protocol: "HTTP/1.1",
                secret: create_secret(),
                server_limits: Arc::new(Limits::server()),
                client_limits: Arc::new(Limits::client()),
                stages: RwLock::new(stages),
                pass_handler,
                net_connector,
                send_connector,
                client_handler,
                client_route,
                router: RwLock::new(router),
                auth: Mutex::new(AuthRegistry::default()),
                conns: Mutex::new(Vec::new()),
                total_connections: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                shutdown_at: Mutex::new(None),
                exit_timeout: Mutex::new(DEFAULT_EXIT_TIMEOUT),
                timer: Mutex::new(None),
                timer_warned: AtomicBool::new(false),
                dates: Mutex::new(DateCache::new()),
                actions: Mutex::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                default_client: Mutex::new(("127.0.0.1".to_string(), 80)),
                proxy: Mutex::new(None),
            }),
        }
    }

    // ===== identification =====

    /// The protocol the engine speaks.
    pub fn protocol(&self) -> &'static str {
        self.inner.protocol
    }

    /// The software identification string used in `Server` headers.
    pub fn software(&self) -> String {
        lock(&self.inner.software).clone()
    }

    /// Override the software identification string.
    pub fn set_software(&self, software: &str) {
        *lock(&self.inner.software) = software.to_string();
    }

    /// The random secret derived at engine creation, hex encoded. Used for
    /// digest and nonce construction.
    pub fn secret(&self) -> &str {
        &self.inner.secret
    }

    // ===== limits =====

    /// Default limits attached to accepted (server) connections.
    pub fn server_limits(&self) -> Arc<Limits> {
        self.inner.server_limits.clone()
    }

    /// Default limits attached to initiated (client) connections.
    pub fn client_limits(&self) -> Arc<Limits> {
        self.inner.client_limits.clone()
    }

    // ===== stages and routing =====

    /// Register an additional stage. Must happen before connections are
    /// processed; the registry is read-only after that.
    pub fn register_stage(&self, stage: Arc<dyn Stage>) {
        self.inner
            .stages
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .add(stage);
    }

    /// Look up a stage by (case-insensitive) name.
    pub fn lookup_stage(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.inner
            .stages
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .lookup(name)
    }

    pub(crate) fn pass_handler(&self) -> Arc<dyn Stage> {
        self.inner.pass_handler.clone()
    }

    pub(crate) fn net_connector(&self) -> Arc<dyn Stage> {
        self.inner.net_connector.clone()
    }

    pub(crate) fn send_connector(&self) -> Arc<dyn Stage> {
        self.inner.send_connector.clone()
    }

    pub(crate) fn client_handler(&self) -> Arc<dyn Stage> {
        self.inner.client_handler.clone()
    }

    pub(crate) fn client_route(&self) -> Arc<Route> {
        self.inner.client_route.clone()
    }

    /// Install the router collaborator.
    pub fn set_router(&self, router: Arc<dyn Router>) {
        *self
            .inner
            .router
            .write()
            .unwrap_or_else(|err| err.into_inner()) = router;
    }

    pub(crate) fn router(&self) -> Arc<dyn Router> {
        self.inner
            .router
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    // ===== authentication =====

    /// Register an authentication backend under a name.
    pub fn register_auth_backend(&self, name: &str, backend: Arc<dyn AuthBackend>) {
        lock(&self.inner.auth).register(name, backend);
    }

    /// Select the active authentication backend. Returns false when no
    /// backend of that name is registered.
    pub fn set_auth_backend(&self, name: &str) -> bool {
        lock(&self.inner.auth).select(name)
    }

    /// Validate credentials with the active backend.
    pub fn validate_cred(
        &self,
        realm: &str,
        user: &str,
        password: &str,
        required_pass: Option<&str>,
    ) -> Result<()> {
        lock(&self.inner.auth).validate_cred(realm, user, password, required_pass)
    }

    /// Fetch a stored password from the active backend, if it reveals one.
    pub fn get_password(&self, realm: &str, user: &str) -> Option<String> {
        lock(&self.inner.auth).get_password(realm, user)
    }

    // ===== actions and cache =====

    /// Bind a callback to a URI for the action handler.
    pub fn define_action<F>(&self, uri: &str, action: F)
    where
        F: Fn(&mut Conn) + Send + Sync + 'static,
    {
        lock(&self.inner.actions).insert(uri.to_string(), Arc::new(action));
    }

    pub(crate) fn action(&self, uri: &str) -> Option<Arc<ActionFn>> {
        lock(&self.inner.actions).get(uri).cloned()
    }

    /// Record a response for the cache handler to serve.
    pub fn cache_response(&self, uri: &str, status: u16, body: Bytes) {
        lock(&self.inner.cache).insert(uri.to_string(), (status, body));
    }

    pub(crate) fn cached(&self, uri: &str) -> Option<(u16, Bytes)> {
        lock(&self.inner.cache).get(uri).cloned()
    }

    // ===== client defaults and proxy =====

    /// Default host and port for client requests without a `Host` header.
    pub fn default_client(&self) -> (String, u16) {
        lock(&self.inner.default_client).clone()
    }

    /// Set the default client host and port.
    pub fn set_default_client(&self, host: &str, port: u16) {
        *lock(&self.inner.default_client) = (host.to_string(), port);
    }

    /// The configured outbound proxy, if any.
    pub fn proxy(&self) -> Option<(String, u16)> {
        lock(&self.inner.proxy).clone()
    }

    /// Route client requests through a proxy.
    pub fn set_proxy(&self, host: &str, port: u16) {
        *lock(&self.inner.proxy) = Some((host.to_string(), port));
    }

    // ===== dates =====

    /// The cached `Date` header value, refreshed at most once per second.
    pub fn date_header(&self) -> HeaderValue {
        let mut dates = lock(&self.inner.dates);
        dates.refresh(Instant::now());
        dates.current()
    }

    /// The cached `Expires` header value, one day ahead.
    pub fn expires_header(&self) -> HeaderValue {
        let mut dates = lock(&self.inner.dates);
        dates.refresh(Instant::now());
        dates.expires()
    }

    // ===== connections =====

    /// Accept a server-side connection over `transport`.
    pub fn accept(&self, transport: Box<dyn Transport>) -> Result<ConnRef> {
        self.accept_with_limits(transport, self.server_limits())
    }

    /// Accept a server-side connection with specific limits.
    pub fn accept_with_limits(
        &self,
        transport: Box<dyn Transport>,
        limits: Arc<Limits>,
    ) -> Result<ConnRef> {
        self.add_conn(transport, limits, true)
    }

    /// Open a client-side connection over `transport`.
    pub fn connect(&self, transport: Box<dyn Transport>) -> Result<ConnRef> {
        self.connect_with_limits(transport, self.client_limits())
    }

    /// Open a client-side connection with specific limits.
    pub fn connect_with_limits(
        &self,
        transport: Box<dyn Transport>,
        limits: Arc<Limits>,
    ) -> Result<ConnRef> {
        self.add_conn(transport, limits, false)
    }

    fn add_conn(
        &self,
        transport: Box<dyn Transport>,
        limits: Arc<Limits>,
        endpoint: bool,
    ) -> Result<ConnRef> {
        if self.is_shutting_down() {
            return Err(Error::new_shutdown());
        }
        {
            let conns = lock(&self.inner.conns);
            if conns.len() as u32 >= limits.connections_max {
                return Err(Error::new_overloaded());
            }
        }
        let seqno = self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
        let mut conn = Conn::new(self.clone(), transport, limits, endpoint, seqno);
        conn.set_state(State::Connected);
        let conn = Arc::new(Mutex::new(conn));
        lock(&self.inner.conns).push(conn.clone());
        self.ensure_timer();
        Ok(conn)
    }

    /// Remove a connection from the registry.
    pub fn remove_conn(&self, seqno: u64) {
        lock(&self.inner.conns).retain(|conn| lock(conn).seqno() != seqno);
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.conns).len()
    }

    /// Whether every connection is either new or complete.
    pub fn is_idle(&self) -> bool {
        lock(&self.inner.conns).iter().all(|conn| {
            let state = lock(conn).state();
            state == State::Begin || state == State::Complete
        })
    }

    // ===== shutdown =====

    /// Begin a graceful drain. In-flight requests get the exit-timeout
    /// grace; idle and unparsed connections are aborted right away.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let mut at = lock(&self.inner.shutdown_at);
        if at.is_none() {
            *at = Some(Instant::now());
        }
        drop(at);
        self.run_maintenance(Instant::now());
    }

    /// Whether a graceful drain is in progress.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Grace period granted to in-flight requests during shutdown.
    /// Zero aborts everything immediately.
    pub fn set_exit_timeout(&self, timeout: Duration) {
        *lock(&self.inner.exit_timeout) = timeout;
    }

    // ===== maintenance =====

    /// One pass of the housekeeping the maintenance timer runs each second.
    ///
    /// Refreshes the date cache, decides per-connection timeout aborts, and
    /// prunes closed connections. Returns whether the timer should keep
    /// running, which is exactly "connections remain registered".
    pub fn run_maintenance(&self, now: Instant) -> bool {
        lock(&self.inner.dates).refresh(now);

        let stopping = self.is_shutting_down();
        let grace = *lock(&self.inner.exit_timeout);
        let hard_stop = stopping && {
            let at = *lock(&self.inner.shutdown_at);
            grace.is_zero()
                || at.map_or(true, |at| now.saturating_duration_since(at) > grace)
        };

        let conns: Vec<ConnRef> = lock(&self.inner.conns).clone();
        for handle in &conns {
            let mut conn = lock(handle);
            if conn.timeout_scheduled() {
                continue;
            }
            let limits = conn.limits().clone();
            let state = conn.state();
            let idle = now.saturating_duration_since(conn.last_activity_at());
            let age = now.saturating_duration_since(conn.started_at());

            let mut reason = None;
            if conn.is_server()
                && state > State::Connected
                && state < State::Parsed
                && age > Limits::effective(limits.request_parse_timeout)
            {
                reason = Some(TimeoutReason::Parse);
            } else if idle > Limits::effective(limits.inactivity_timeout) {
                reason = Some(TimeoutReason::Inactivity);
            } else if age > Limits::effective(limits.request_timeout) {
                reason = Some(TimeoutReason::Request);
            } else if stopping {
                let drainable = state == State::Complete
                    || (state > State::Connected && state < State::Parsed);
                if hard_stop || drainable {
                    reason = Some(TimeoutReason::Shutdown);
                }
            }
            if let Some(reason) = reason {
                tracing::debug!(seqno = conn.seqno(), ?reason, "connection timeout");
                conn.schedule_timeout(reason);
            }
        }

        let mut conns = lock(&self.inner.conns);
        conns.retain(|handle| {
            let conn = lock(handle);
            !(conn.state() == State::Complete && conn.keep_alive_count() < 0)
        });
        !conns.is_empty()
    }

    /// Whether the maintenance timer task currently exists.
    pub fn has_maintenance_timer(&self) -> bool {
        lock(&self.inner.timer).is_some()
    }

    /// Spawn the maintenance timer if none is running.
    ///
    /// A single guarded slot holds the task handle, so at most one timer
    /// exists while connections are registered. Without an async runtime
    /// the engine warns once and leaves maintenance to the caller.
    fn ensure_timer(&self) {
        let mut slot = lock(&self.inner.timer);
        if slot.is_some() {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                if !self.inner.timer_warned.swap(true, Ordering::SeqCst) {
                    tracing::warn!(
                        "no async runtime; drive Engine::run_maintenance about once per second"
                    );
                }
                return;
            }
        };
        let engine = self.clone();
        *slot = Some(handle.spawn(async move {
            let mut interval = tokio::time::interval(TIMER_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !engine.run_maintenance(Instant::now()) {
                    // Re-check under the slot lock so a connection accepted
                    // at this instant restarts with a live timer.
                    let mut slot = lock(&engine.inner.timer);
                    if engine.connection_count() == 0 {
                        *slot = None;
                        break;
                    }
                }
            }
        }));
    }
}

impl Default for Engine {
    fn default() -> Engine {
        Engine::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("connections", &self.connection_count())
            .field("shutdown", &self.is_shutting_down())
            .finish()
    }
}

/// Derive the fixed-length random hex secret, falling back to a time and
/// pid mix when the OS RNG fails. The fallback is loud: it weakens any
/// digest built from the secret.
fn create_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    if let Err(err) = OsRng.try_fill_bytes(&mut bytes) {
        tracing::error!(
            error = %err,
            "cannot get sufficient random data for secure operation; \
             falling back to a time/pid mix"
        );
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let pid = std::process::id();
        let mix = nanos ^ u128::from(pid);
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (mix >> ((i % 16) * 8)) as u8 ^ (i as u8).wrapping_mul(31);
        }
    }
    let mut secret = String::with_capacity(SECRET_BYTES * 2);
    for byte in bytes {
        let _ = write!(secret, "{:02x}", byte);
    }
    secret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_stages_are_registered() {
        let engine = Engine::new();
        for name in [
            "netConnector",
            "sendConnector",
            "rangeFilter",
            "chunkFilter",
            "uploadFilter",
            "passHandler",
            "cacheHandler",
            "actionHandler",
            "client",
        ] {
            assert!(engine.lookup_stage(name).is_some(), "missing {}", name);
        }
    }

    #[test]
    fn secret_is_fixed_length_hex() {
        let engine = Engine::new();
        let secret = engine.secret();
        assert_eq!(secret.len(), SECRET_BYTES * 2);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn engines_have_distinct_secrets() {
        let first = Engine::new();
        let second = Engine::new();
        assert_ne!(first.secret(), second.secret());
    }

    #[test]
    fn date_header_is_cached() {
        let engine = Engine::new();
        let first = engine.date_header();
        let second = engine.date_header();
        assert_eq!(first, second);
        assert_ne!(engine.expires_header(), first);
    }

    #[test]
    fn client_defaults_and_proxy() {
        let engine = Engine::new();
        assert_eq!(engine.default_client(), ("127.0.0.1".to_string(), 80));
        engine.set_default_client("10.0.0.1", 8080);
        assert_eq!(engine.default_client(), ("10.0.0.1".to_string(), 8080));
        assert!(engine.proxy().is_none());
        engine.set_proxy("proxy.local", 3128);
        assert_eq!(engine.proxy(), Some(("proxy.local".to_string(), 3128)));
    }

    #[test]
    fn protocol_and_software() {
        let engine = Engine::new();
        assert_eq!(engine.protocol(), "HTTP/1.1");
        assert!(engine.software().starts_with("brazier/"));
        engine.set_software("unit/1.0");
        assert_eq!(engine.software(), "unit/1.0");
    }
}
