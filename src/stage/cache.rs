//! The cache handler: serves recorded responses.

use crate::conn::Conn;
use crate::queue::{Dir, QueueId};
use crate::route::Route;
use crate::stage::{Stage, StageKind};

/// Serves responses previously recorded in the engine response cache.
/// Joins the pipeline only when the route enables caching and the cache
/// holds an entry for the request URI.
pub struct CacheHandler;

impl CacheHandler {
    pub(crate) fn new() -> CacheHandler {
        CacheHandler
    }
}

impl Stage for CacheHandler {
    fn name(&self) -> &str {
        "cacheHandler"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    fn matches(&self, conn: &Conn, route: &Route, _dir: Dir) -> bool {
        route.caching
            && conn
                .rx()
                .map_or(false, |rx| conn.engine().cached(&rx.uri).is_some())
    }

    fn ready(&self, conn: &mut Conn, _q: QueueId) {
        let entry = conn
            .rx
            .as_ref()
            .and_then(|rx| conn.engine().cached(&rx.uri));
        match entry {
            Some((status, body)) => {
                if let Some(tx) = conn.tx.as_mut() {
                    tx.status = status;
                }
                let _ = conn.write(body);
                conn.finalize();
            }
            None => conn.finalize(),
        }
    }
}
