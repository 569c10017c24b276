//! Host-based routing table with atomic publication
//!
//! A [`RouterState`] pairs two maps keyed by the lowercased host name:
//! host → composed handler and host → runtime backend. States are built
//! whole and swapped through an atomic pointer; the request path does a
//! single atomic load and never takes a lock.

use crate::balancer::Backend;
use crate::config::{Config, ServerSpec};
use crate::error::ProxyBody;
use crate::forward::{forward_handler, Forwarder};
use crate::middleware::MiddlewareRegistry;
use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// A compiled request handler for one virtual host
pub type Handler =
    Arc<dyn Fn(Request<Incoming>, SocketAddr) -> HandlerFuture + Send + Sync + 'static>;

pub type HandlerFuture = BoxFuture<'static, Response<ProxyBody>>;

/// One published routing table. Never mutated in place.
#[derive(Default)]
pub struct RouterState {
    handlers: HashMap<String, Handler>,
    backends: HashMap<String, Arc<Backend>>,
}

impl RouterState {
    /// Look up the handler for a host, case-insensitively.
    pub fn handler(&self, host: &str) -> Option<Handler> {
        self.handlers.get(&host.to_lowercase()).cloned()
    }

    /// Look up the runtime backend for a host, case-insensitively.
    pub fn backend(&self, host: &str) -> Option<Arc<Backend>> {
        self.backends.get(&host.to_lowercase()).cloned()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    pub fn backends(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.backends.values()
    }

    pub fn handler_hosts(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// The routing table publisher
pub struct Router {
    state: ArcSwap<RouterState>,
    forwarder: Arc<Forwarder>,
    registry: MiddlewareRegistry,
}

impl Router {
    pub fn new(forwarder: Arc<Forwarder>, registry: MiddlewareRegistry) -> Self {
        Self {
            state: ArcSwap::from_pointee(RouterState::default()),
            forwarder,
            registry,
        }
    }

    /// Compile every server in the configuration and publish the new state
    /// atomically. In-flight requests keep the handler they resolved.
    pub fn publish(&self, config: &Config) {
        let mut handlers = HashMap::with_capacity(config.servers.len());
        let mut backends = HashMap::with_capacity(config.servers.len());
        for spec in &config.servers {
            let (handler, backend) = self.compile(spec);
            let key = spec.name.to_lowercase();
            handlers.insert(key.clone(), handler);
            backends.insert(key, backend);
        }
        debug!(hosts = backends.len(), "publishing router state");
        self.state.store(Arc::new(RouterState { handlers, backends }));
    }

    /// Compile one server and publish a state containing it alongside the
    /// existing entries. Used by the control plane for incremental changes.
    pub fn insert(&self, spec: &ServerSpec) {
        let current = self.state.load_full();
        let mut handlers = current.handlers.clone();
        let mut backends = current.backends.clone();
        let (handler, backend) = self.compile(spec);
        let key = spec.name.to_lowercase();
        handlers.insert(key.clone(), handler);
        backends.insert(key, backend);
        self.state.store(Arc::new(RouterState { handlers, backends }));
    }

    /// The currently published state.
    pub fn current(&self) -> Arc<RouterState> {
        self.state.load_full()
    }

    fn compile(&self, spec: &ServerSpec) -> (Handler, Arc<Backend>) {
        let backend = Arc::new(Backend::from_spec(spec));
        let base = forward_handler(Arc::clone(&backend), Arc::clone(&self.forwarder));
        let handler = self.registry.compose(base, &spec.middlewares);
        (handler, backend)
    }
}
