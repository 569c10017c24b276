//! Middleware registry and chain composition
//!
//! A middleware is addressed by name and configured with an opaque value
//! taken verbatim from the configuration. Each registry entry is a factory
//! that coerces the value into its own shape and returns a layer; a value
//! the factory cannot coerce skips the middleware with a warning instead of
//! failing the host.

use crate::config::MiddlewareSpec;
use crate::ratelimit::{ratelimit_layer, RateLimitConfig, RateLimiter};
use crate::router::Handler;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Wraps a handler with additional behavior
pub type Layer = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Builds a layer from an opaque configuration value; `None` means the
/// value could not be coerced
pub type Factory = Arc<dyn Fn(&serde_json::Value) -> Option<Layer> + Send + Sync>;

/// Registry name of the built-in rate limiter
pub const RATELIMITER_NAME: &str = "mogoly:ratelimiter";

pub struct MiddlewareRegistry {
    entries: HashMap<String, Factory>,
}

impl MiddlewareRegistry {
    /// An empty registry; hosts get bare forwarders.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The standard registry with the built-in middlewares registered.
    pub fn standard(limiter: Arc<RateLimiter>) -> Self {
        let mut registry = Self::new();
        registry.register(
            RATELIMITER_NAME,
            Arc::new(move |value| {
                let config = RateLimitConfig::coerce(value)?;
                Some(ratelimit_layer(Arc::clone(&limiter), config))
            }),
        );
        registry
    }

    pub fn register(&mut self, name: &str, factory: Factory) {
        self.entries.insert(name.to_string(), factory);
    }

    /// Wrap `base` in the layers named by `specs`. The first listed
    /// middleware ends up outermost.
    pub fn compose(&self, base: Handler, specs: &[MiddlewareSpec]) -> Handler {
        let mut layers = Vec::new();
        for spec in specs {
            match self.entries.get(&spec.name) {
                Some(factory) => match factory(&spec.config) {
                    Some(layer) => layers.push(layer),
                    None => warn!(
                        middleware = %spec.name,
                        "middleware config not coercible, skipping"
                    ),
                },
                None => warn!(middleware = %spec.name, "unknown middleware, skipping"),
            }
        }

        let mut handler = base;
        for layer in layers.iter().rev() {
            handler = layer(handler);
        }
        handler
    }
}

impl Default for MiddlewareRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::text_response;
    use hyper::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn nop_handler() -> Handler {
        Arc::new(|_req, _addr| Box::pin(async { text_response(StatusCode::OK, "ok") }))
    }

    fn counting_layer(counter: Arc<AtomicUsize>) -> Layer {
        Arc::new(move |next: Handler| {
            counter.fetch_add(1, Ordering::SeqCst);
            next
        })
    }

    #[test]
    fn test_unknown_middleware_is_skipped() {
        let registry = MiddlewareRegistry::new();
        // Composing with an unknown name must not panic or drop the host.
        let _handler = registry.compose(
            nop_handler(),
            &[MiddlewareSpec {
                name: "mogoly:unknown".to_string(),
                config: serde_json::Value::Null,
            }],
        );
    }

    #[test]
    fn test_uncoercible_config_is_skipped() {
        let applied = Arc::new(AtomicUsize::new(0));
        let mut registry = MiddlewareRegistry::new();
        let layer_applied = Arc::clone(&applied);
        registry.register(
            "strict",
            Arc::new(move |value| {
                value.as_object()?;
                Some(counting_layer(Arc::clone(&layer_applied)))
            }),
        );

        let _handler = registry.compose(
            nop_handler(),
            &[MiddlewareSpec {
                name: "strict".to_string(),
                config: serde_json::json!("not an object"),
            }],
        );
        assert_eq!(applied.load(Ordering::SeqCst), 0);

        let _handler = registry.compose(
            nop_handler(),
            &[MiddlewareSpec {
                name: "strict".to_string(),
                config: serde_json::json!({}),
            }],
        );
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_every_listed_layer_is_applied() {
        let applied = Arc::new(AtomicUsize::new(0));
        let mut registry = MiddlewareRegistry::new();
        let layer_applied = Arc::clone(&applied);
        registry.register(
            "count",
            Arc::new(move |_value| Some(counting_layer(Arc::clone(&layer_applied)))),
        );

        let specs = vec![
            MiddlewareSpec {
                name: "count".to_string(),
                config: serde_json::Value::Null,
            },
            MiddlewareSpec {
                name: "count".to_string(),
                config: serde_json::Value::Null,
            },
        ];
        let _handler = registry.compose(nop_handler(), &specs);
        assert_eq!(applied.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_standard_registry_has_ratelimiter() {
        let registry = MiddlewareRegistry::standard(Arc::new(RateLimiter::new()));
        assert!(registry.entries.contains_key(RATELIMITER_NAME));
    }
}
