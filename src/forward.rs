//! Reverse-proxy core: outbound request construction and forwarding
//!
//! One pooled upstream client is built at startup and shared by every
//! virtual host. Backend URLs are parsed once per backend and memoized;
//! the hot path only joins paths and rewrites headers.

use crate::balancer::{Backend, SelectError};
use crate::error::{json_error_response, text_response, ProxyBody, ProxyErrorCode};
use crate::router::Handler;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// A backend URL broken into the pieces the request builder needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub scheme: String,
    pub authority: String,
    /// Path prefix the inbound path is joined onto
    pub path: String,
}

impl ForwardTarget {
    pub fn parse(url: &str) -> anyhow::Result<Self> {
        let uri: Uri = url.parse()?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| anyhow::anyhow!("backend URL missing scheme: {}", url))?
            .to_string();
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow::anyhow!("backend URL missing authority: {}", url))?
            .to_string();
        Ok(Self {
            scheme,
            authority,
            path: uri.path().to_string(),
        })
    }
}

/// Join two path segments with exactly one '/' at the boundary.
pub fn single_slash_join(a: &str, b: &str) -> String {
    let slash_a = a.ends_with('/');
    let slash_b = b.starts_with('/');
    match (slash_a, slash_b) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Append the forwarding headers the backend sees.
///
/// `X-Forwarded-For` is appended to, not overwritten: this proxy may sit
/// behind another trusted hop.
fn append_forward_headers(
    headers: &mut HeaderMap,
    inbound_host: Option<&str>,
    client_addr: SocketAddr,
    scheme: &str,
) {
    let ip = client_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(scheme) {
        headers.insert(X_FORWARDED_PROTO, value);
    }
    if let Some(host) = inbound_host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert(X_FORWARDED_HOST, value);
        }
    }
}

/// Shared upstream client for request forwarding
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
}

impl Forwarder {
    pub fn new() -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_all_versions()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self { client }
    }

    /// Resolve a backend for the virtual host and stream the request to it.
    pub async fn handle(
        &self,
        vhost: &Arc<Backend>,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let backend = if vhost.has_members() {
            match vhost.next_member() {
                Ok(member) => member,
                Err(SelectError::Empty) => {
                    error!(vhost = %vhost.name, "balancing set is empty");
                    return text_response(StatusCode::SERVICE_UNAVAILABLE, "No backend available");
                }
            }
        } else {
            // Single-upstream mode: the virtual host is its own target.
            Arc::clone(vhost)
        };

        let target = match backend.target() {
            Ok(target) => target.clone(),
            Err(e) => {
                error!(backend = %backend.name, error = %e, "invalid backend URL");
                return json_error_response(ProxyErrorCode::InvalidBackendUrl, "Invalid backend url");
            }
        };

        let (parts, body) = req.into_parts();
        let inbound_host = parts
            .headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned);

        let joined = single_slash_join(&target.path, parts.uri.path());
        let path_and_query = match parts.uri.query() {
            Some(query) if !query.is_empty() => format!("{}?{}", joined, query),
            _ => joined,
        };
        let uri: Uri = match format!("{}://{}{}", target.scheme, target.authority, path_and_query)
            .parse()
        {
            Ok(uri) => uri,
            Err(e) => {
                error!(backend = %backend.name, error = %e, "cannot build outbound URI");
                return json_error_response(
                    ProxyErrorCode::InternalError,
                    "Failed to create backend request",
                );
            }
        };

        let mut outbound = match Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .body(body)
        {
            Ok(request) => request,
            Err(e) => {
                error!(backend = %backend.name, error = %e, "cannot build outbound request");
                return json_error_response(
                    ProxyErrorCode::InternalError,
                    "Failed to create backend request",
                );
            }
        };
        *outbound.headers_mut() = parts.headers;
        append_forward_headers(
            outbound.headers_mut(),
            inbound_host.as_deref(),
            client_addr,
            &target.scheme,
        );

        debug!(
            method = %outbound.method(),
            uri = %outbound.uri(),
            backend = %backend.name,
            "forwarding request"
        );

        match self.client.request(outbound).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                error!(backend = %backend.name, error = %e, "failed to reach backend");
                json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Failed to connect to backend",
                )
            }
        }
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

/// Compile the base request handler for a virtual host.
pub fn forward_handler(vhost: Arc<Backend>, forwarder: Arc<Forwarder>) -> Handler {
    Arc::new(move |req, client_addr| {
        let vhost = Arc::clone(&vhost);
        let forwarder = Arc::clone(&forwarder);
        Box::pin(async move { forwarder.handle(&vhost, req, client_addr).await })
    })
}
