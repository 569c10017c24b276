//! Mogoly - a multi-tenant reverse proxy with a live control plane
//!
//! This library provides a host-routing HTTP/HTTPS reverse proxy that:
//! - Routes traffic based on the Host header to configured virtual hosts
//! - Balances fan-out virtual hosts round-robin across healthy members
//! - Actively health-checks balancing members and biases selection
//! - Terminates TLS with SNI-selected certificates: self-signed leaves for
//!   local-like names, ACME-issued certificates for public names
//! - Rate-limits clients with a per-IP sliding window middleware
//! - Hot-reloads its routing table when the config file changes
//! - Accepts live reconfiguration over a persistent WebSocket control plane

pub mod acme;
pub mod balancer;
pub mod config;
pub mod control;
pub mod control_client;
pub mod error;
pub mod events;
pub mod forward;
pub mod healthcheck;
pub mod middleware;
pub mod proxy;
pub mod ratelimit;
pub mod router;
pub mod tls;
pub mod watcher;
