//! HTTP and HTTPS listeners and request dispatch
//!
//! Both listeners resolve the virtual host from the lowercased Host header
//! with a single atomic router load. The HTTP entry additionally answers
//! ACME HTTP-01 challenges and issues the HTTPS redirect for hosts marked
//! force-TLS.

use crate::acme::Http01Challenges;
use crate::error::{json_error_response, ProxyBody, ProxyErrorCode};
use crate::router::Router;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// One accept loop, plain or TLS-terminating
pub struct ProxyListener {
    bind_addr: SocketAddr,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    acme_challenges: Option<Http01Challenges>,
    listener: Option<TcpListener>,
}

impl ProxyListener {
    pub fn new(bind_addr: SocketAddr, router: Arc<Router>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
            tls_acceptor: None,
            acme_challenges: None,
            listener: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Answer ACME HTTP-01 challenges on this listener
    pub fn with_acme_challenges(mut self, challenges: Http01Challenges) -> Self {
        self.acme_challenges = Some(challenges);
        self
    }

    /// Bind now and report the effective local address. Useful with port 0.
    pub async fn bind(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(addr)
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => TcpListener::bind(self.bind_addr).await?,
        };
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "https" } else { "http" };
        info!(addr = %local_addr, protocol, "proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let challenges = self.acme_challenges.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = serve_connection(tls_stream, addr, router, true, None).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = serve_connection(stream, addr, router, false, challenges).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(addr = %local_addr, "proxy listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    router: Arc<Router>,
    is_tls: bool,
    challenges: Option<Http01Challenges>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        let challenges = challenges.clone();
        async move { Ok::<_, hyper::Error>(dispatch(req, addr, router, is_tls, challenges).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

/// Route one request through the published router state.
pub async fn dispatch(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    router: Arc<Router>,
    is_tls: bool,
    challenges: Option<Http01Challenges>,
) -> Response<ProxyBody> {
    if let Some(challenges) = &challenges {
        if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
            if let Some(key_auth) = challenges.get(token) {
                debug!(token, "answering ACME HTTP-01 challenge");
                return Response::builder()
                    .status(StatusCode::OK)
                    .header(hyper::header::CONTENT_TYPE, "text/plain")
                    .body(Full::new(Bytes::from(key_auth)).map_err(|e| match e {}).boxed())
                    .expect("valid response builder");
            }
        }
    }

    let raw_host = match req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
    {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => {
            return json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            )
        }
    };
    let host = routing_key(&raw_host);

    let state = router.current();

    if !is_tls {
        if let Some(backend) = state.backend(&host) {
            if backend.force_tls {
                debug!(host = %host, "redirecting to HTTPS");
                return https_redirect(&req, &raw_host);
            }
        }
    }

    match state.handler(&host) {
        Some(handler) => handler(req, client_addr).await,
        None => {
            debug!(host = %host, "no virtual host configured");
            json_error_response(ProxyErrorCode::UnknownHost, "Unknown or unconfigured host")
        }
    }
}

/// The lowercased Host header without any port suffix.
fn routing_key(raw_host: &str) -> String {
    raw_host
        .split(':')
        .next()
        .unwrap_or(raw_host)
        .to_lowercase()
}

/// 301 to the same URL over https, preserving Host, path and query.
fn https_redirect(req: &Request<Incoming>, raw_host: &str) -> Response<ProxyBody> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{}{}", raw_host, path_and_query);

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Redirecting to HTTPS"))
                .map_err(|e| match e {})
                .boxed(),
        )
        .expect("valid response builder")
}
