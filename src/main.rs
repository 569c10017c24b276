use mogoly::acme::{AcmeConfig, AcmeManager};
use mogoly::config::{self, Config};
use mogoly::control::ControlServer;
use mogoly::events::{payload, EventBus, EventKind};
use mogoly::forward::Forwarder;
use mogoly::healthcheck::HealthChecker;
use mogoly::middleware::MiddlewareRegistry;
use mogoly::proxy::ProxyListener;
use mogoly::ratelimit::RateLimiter;
use mogoly::router::Router;
use mogoly::tls::CertManager;
use mogoly::watcher::watch_config;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// Environment variable that selects the ACME CA endpoint
const DEPLOY_ENV_KEY: &str = "MOGOLY_ENV";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mogoly=info".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mogoly.yaml"));

    let initial_config = config::load_config(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "failed to load configuration");
        e
    })?;
    info!(
        path = %config_path.display(),
        servers = initial_config.servers.len(),
        "configuration loaded"
    );

    let events = EventBus::new();
    spawn_event_logger(&events);

    let limiter = Arc::new(RateLimiter::new());
    let registry = MiddlewareRegistry::standard(Arc::clone(&limiter));
    let forwarder = Arc::new(Forwarder::new());
    let router = Arc::new(Router::new(forwarder, registry));
    router.publish(&initial_config);

    let live_config = Arc::new(Mutex::new(initial_config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // TLS: self-signed leaves always work; ACME needs an operator email.
    let (acme_store, acme_challenges) = match std::env::var("MOGOLY_ACME_EMAIL") {
        Ok(email) if !email.is_empty() => {
            let cache_dir = std::env::var("MOGOLY_ACME_CACHE")
                .unwrap_or_else(|_| "./acme_cache".to_string());
            let manager = AcmeManager::new(
                AcmeConfig {
                    email,
                    cache_dir: PathBuf::from(cache_dir),
                    env_key: DEPLOY_ENV_KEY.to_string(),
                    directory_url: None,
                },
                events.clone(),
            )?;
            let store = manager.store();
            let challenges = manager.http01_challenges();
            let acme_shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.run(acme_shutdown).await {
                    error!(error = %e, "ACME manager error");
                }
            });
            info!("ACME certificate provisioning enabled");
            (Some(store), Some(challenges))
        }
        _ => {
            warn!("MOGOLY_ACME_EMAIL not set, public hostnames will not get certificates");
            (None, None)
        }
    };

    let cert_manager = Arc::new(CertManager::new(acme_store, events.clone()));
    let tls_acceptor = TlsAcceptor::from(Arc::new(cert_manager.server_config()));

    // Listeners
    let http_addr = bind_addr("MOGOLY_HTTP_ADDR", "0.0.0.0:80")?;
    let https_addr = bind_addr("MOGOLY_HTTPS_ADDR", "0.0.0.0:443")?;
    let control_addr = bind_addr("MOGOLY_CONTROL_ADDR", "127.0.0.1:7654")?;

    let mut http_listener = ProxyListener::new(http_addr, Arc::clone(&router), shutdown_rx.clone());
    if let Some(challenges) = acme_challenges {
        http_listener = http_listener.with_acme_challenges(challenges);
    }
    let http_bound = http_listener.bind().await?;
    tokio::spawn(async move {
        if let Err(e) = http_listener.run().await {
            error!(error = %e, "HTTP listener error");
        }
    });

    let mut https_listener = ProxyListener::new(https_addr, Arc::clone(&router), shutdown_rx.clone())
        .with_tls(tls_acceptor);
    let https_bound = https_listener.bind().await?;
    tokio::spawn(async move {
        if let Err(e) = https_listener.run().await {
            error!(error = %e, "HTTPS listener error");
        }
    });

    let mut control_server = ControlServer::new(
        control_addr,
        Arc::clone(&router),
        Arc::clone(&live_config),
        events.clone(),
        shutdown_rx.clone(),
    );
    let control_bound = control_server.bind().await?;
    tokio::spawn(async move {
        if let Err(e) = control_server.run().await {
            error!(error = %e, "control plane error");
        }
    });

    events.publish(
        EventKind::ServerStarted,
        "proxy started",
        payload([
            ("http", http_bound.to_string()),
            ("https", https_bound.to_string()),
            ("control", control_bound.to_string()),
        ]),
    );

    // Config hot reload
    let reload_router = Arc::clone(&router);
    let reload_live = Arc::clone(&live_config);
    let _watcher = watch_config(&config_path, move |new_config: Config| {
        reload_router.publish(&new_config);
        *reload_live.lock() = new_config;
    })?;

    // Health-check driver
    spawn_health_driver(
        Arc::clone(&router),
        Arc::clone(&live_config),
        shutdown_rx.clone(),
    );

    limiter.spawn_reaper(shutdown_rx.clone());

    wait_for_shutdown().await;

    let _ = shutdown_tx.send(true);
    // Give the accept loops a moment to drain.
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("shutdown complete");
    Ok(())
}

fn bind_addr(env_key: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let raw = std::env::var(env_key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|e| anyhow::anyhow!("invalid address {:?} for {}: {}", raw, env_key, e))
}

/// Mirror bus events into the log.
fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => info!(
                    event = event.kind.as_str(),
                    message = %event.message,
                    payload = %serde_json::Value::Object(event.payload.clone()),
                    "event"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Sweep every fan-out virtual host on the configured interval.
fn spawn_health_driver(
    router: Arc<Router>,
    live_config: Arc<Mutex<Config>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let checker = HealthChecker::new();
        loop {
            let interval_secs = live_config.lock().healthcheck_interval;
            let sleep_for = if interval_secs == 0 {
                // Disabled; poll the config for re-enablement.
                Duration::from_secs(1)
            } else {
                Duration::from_secs(interval_secs)
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    if interval_secs == 0 {
                        continue;
                    }
                    let state = router.current();
                    for backend in state.backends() {
                        if !backend.has_members() {
                            continue;
                        }
                        let report = checker.check_all(backend).await;
                        info!(
                            vhost = %backend.name,
                            pass = report.pass.len(),
                            fail = report.fail.len(),
                            duration_ms = report.duration.as_millis() as u64,
                            "health sweep"
                        );
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
        info!("received ctrl-c, shutting down");
    }
}
