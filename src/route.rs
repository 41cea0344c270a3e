//! Route descriptors.
//!
//! Routing itself is a collaborator: something outside the engine decides
//! which `Route` a request gets. The descriptor names the stages and
//! policies for one matched request; the pipeline builder consumes it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::conn::Rx;

/// Stage lists and policies for one matched request.
#[derive(Debug, Clone, Default)]
pub struct Route {
    /// Handler stage name. Defaults to the pass handler when unset.
    pub handler: Option<String>,
    /// Receive-direction filters, in order from transport to handler.
    pub input_stages: Vec<String>,
    /// Transmit-direction filters, in order from handler to transport.
    pub output_stages: Vec<String>,
    /// Connector override. Defaults to the net connector.
    pub connector: Option<String>,
    /// Status code to error-document URI.
    pub error_documents: HashMap<u16, String>,
    /// Whether the cache handler may serve recorded responses.
    pub caching: bool,
    /// Realm requiring authentication, if any.
    pub auth_realm: Option<String>,
}

impl Route {
    /// An empty route: pass handler, net connector, no filters.
    pub fn new() -> Route {
        Route::default()
    }

    /// The conventional pipeline: chunked decoding and upload accounting
    /// inbound, range and chunked encoding outbound.
    pub fn standard() -> Route {
        Route {
            input_stages: vec!["chunkFilter".into(), "uploadFilter".into()],
            output_stages: vec!["rangeFilter".into(), "chunkFilter".into()],
            ..Route::default()
        }
    }

    /// Set the handler stage by registry name.
    pub fn with_handler(mut self, name: &str) -> Route {
        self.handler = Some(name.to_string());
        self
    }

    /// Map a status code to an error-document URI.
    pub fn with_error_document(mut self, status: u16, uri: &str) -> Route {
        self.error_documents.insert(status, uri.to_string());
        self
    }

    /// Require authentication against a realm.
    pub fn with_auth_realm(mut self, realm: &str) -> Route {
        self.auth_realm = Some(realm.to_string());
        self
    }

    pub(crate) fn error_document(&self, status: u16) -> Option<&str> {
        self.error_documents.get(&status).map(|s| s.as_str())
    }
}

/// The router seam: maps a parsed request to a route descriptor.
pub trait Router: Send + Sync {
    /// Select the route for a parsed request.
    fn route(&self, rx: &Rx) -> Arc<Route>;
}

/// Router that hands every request the same route.
pub struct FixedRouter {
    route: Arc<Route>,
}

impl FixedRouter {
    /// Route every request to `route`.
    pub fn new(route: Route) -> FixedRouter {
        FixedRouter {
            route: Arc::new(route),
        }
    }
}

impl Router for FixedRouter {
    fn route(&self, _rx: &Rx) -> Arc<Route> {
        self.route.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_route_filter_order() {
        let route = Route::standard();
        assert_eq!(route.input_stages, ["chunkFilter", "uploadFilter"]);
        assert_eq!(route.output_stages, ["rangeFilter", "chunkFilter"]);
        assert!(route.handler.is_none());
    }

    #[test]
    fn error_documents() {
        let route = Route::new().with_error_document(404, "/e/404.html");
        assert_eq!(route.error_document(404), Some("/e/404.html"));
        assert_eq!(route.error_document(500), None);
    }
}
