//! Per-client-IP sliding-window rate limiting
//!
//! One process-wide map from client IP to request timestamps backs every
//! configured rate-limiter middleware. The mutex is held only for the
//! trim-and-admit decision, never across downstream I/O. A background
//! reaper drops IPs whose windows have drained.

use crate::error::text_response;
use crate::middleware::Layer;
use crate::router::Handler;
use hyper::StatusCode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

pub const DEFAULT_REQ_PER_MINUTE: usize = 5;
pub const DEFAULT_LIMIT_WINDOW: Duration = Duration::from_secs(60);

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Coerced rate-limiter middleware configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub req_per_minute: usize,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            req_per_minute: DEFAULT_REQ_PER_MINUTE,
            window: DEFAULT_LIMIT_WINDOW,
        }
    }
}

impl RateLimitConfig {
    /// Coerce an opaque configuration value.
    ///
    /// Accepts a null value (all defaults) or a mapping with
    /// `request_per_minute` (integer or numeric) and `limit_window`
    /// (duration string such as "1s" or numeric seconds). Non-positive
    /// values fall back to the defaults. Any other shape is rejected.
    pub fn coerce(value: &serde_json::Value) -> Option<Self> {
        let mut config = Self::default();
        match value {
            serde_json::Value::Null => Some(config),
            serde_json::Value::Object(map) => {
                if let Some(raw) = map.get("request_per_minute") {
                    if let Some(n) = numeric(raw) {
                        if n > 0.0 {
                            config.req_per_minute = n as usize;
                        }
                    }
                }
                if let Some(raw) = map.get("limit_window") {
                    if let Some(window) = duration_value(raw) {
                        if window > Duration::ZERO {
                            config.window = window;
                        }
                    }
                }
                Some(config)
            }
            _ => None,
        }
    }
}

fn numeric(value: &serde_json::Value) -> Option<f64> {
    value.as_f64()
}

fn duration_value(value: &serde_json::Value) -> Option<Duration> {
    match value {
        serde_json::Value::String(s) => parse_duration(s),
        other => numeric(other)
            .filter(|n| *n > 0.0)
            .map(Duration::from_secs_f64),
    }
}

/// Parse a duration string: `500ms`, `1s`, `2m`, `1h`, or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (number, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, "s"),
    };
    let value: f64 = number.parse().ok()?;
    if value < 0.0 {
        return None;
    }
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(seconds))
}

/// Process-wide sliding-window admission state
pub struct RateLimiter {
    visitors: Mutex<HashMap<String, Vec<Instant>>>,
    req_per_minute: AtomicUsize,
    window_millis: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            visitors: Mutex::new(HashMap::new()),
            req_per_minute: AtomicUsize::new(DEFAULT_REQ_PER_MINUTE),
            window_millis: AtomicU64::new(DEFAULT_LIMIT_WINDOW.as_millis() as u64),
        }
    }

    /// Apply a middleware configuration to the shared limits.
    pub fn configure(&self, config: &RateLimitConfig) {
        self.req_per_minute
            .store(config.req_per_minute, Ordering::Relaxed);
        self.window_millis
            .store(config.window.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn limits(&self) -> RateLimitConfig {
        RateLimitConfig {
            req_per_minute: self.req_per_minute.load(Ordering::Relaxed),
            window: Duration::from_millis(self.window_millis.load(Ordering::Relaxed)),
        }
    }

    /// Trim the window for this IP and admit the request when under the
    /// limit. Admitted requests are recorded.
    pub fn allow(&self, ip: &str) -> bool {
        let limits = self.limits();
        let now = Instant::now();

        let mut visitors = self.visitors.lock();
        let times = visitors.entry(ip.to_string()).or_default();
        times.retain(|t| now.duration_since(*t) < limits.window);
        if times.len() >= limits.req_per_minute {
            return false;
        }
        times.push(now);
        true
    }

    /// Drop expired timestamps and forget IPs whose windows are empty.
    pub fn sweep(&self) {
        let window = self.limits().window;
        let now = Instant::now();
        let mut visitors = self.visitors.lock();
        visitors.retain(|_, times| {
            times.retain(|t| now.duration_since(*t) < window);
            !times.is_empty()
        });
    }

    pub fn tracked_ips(&self) -> usize {
        self.visitors.lock().len()
    }

    /// Run the background reaper until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(REAPER_INTERVAL) => {
                        limiter.sweep();
                        debug!(tracked = limiter.tracked_ips(), "rate limiter sweep complete");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the rate-limiting layer for one virtual host.
pub fn ratelimit_layer(limiter: Arc<RateLimiter>, config: RateLimitConfig) -> Layer {
    limiter.configure(&config);
    Arc::new(move |next: Handler| {
        let limiter = Arc::clone(&limiter);
        let next = Arc::clone(&next);
        Arc::new(move |req, client_addr| {
            let limiter = Arc::clone(&limiter);
            let next = Arc::clone(&next);
            Box::pin(async move {
                let ip = client_addr.ip().to_string();
                if !limiter.allow(&ip) {
                    warn!(ip = %ip, "rate limit exceeded");
                    return text_response(StatusCode::TOO_MANY_REQUESTS, "Max request exceed");
                }
                next(req, client_addr).await
            })
        })
    })
}
