//! Active health checking for balancing members
//!
//! Each check is a single GET against the member's resolved URL with a
//! 3-second deadline. A response below 400 counts as healthy; transport
//! errors, timeouts and error statuses count as unhealthy. Up to 4 KiB of a
//! failing response body is read for diagnostics.

use crate::balancer::Backend;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::Request;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// How much of a failing response body is read for diagnostics
const MAX_DIAGNOSTIC_BODY: usize = 4096;

/// Outcome of a single member check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberStatus {
    pub name: String,
    pub url: String,
    pub healthy: bool,
}

/// Outcome of a full sweep over a virtual host's balancing set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub pass: Vec<MemberStatus>,
    pub fail: Vec<MemberStatus>,
    pub check_time: DateTime<Utc>,
    pub duration: Duration,
}

impl HealthReport {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Health probe client, shared across sweeps
pub struct HealthChecker {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_all_versions()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }

    /// Check every balancing member of `vhost`.
    ///
    /// The member list is snapshotted under the host's lock; the probes run
    /// outside it. Each member's health flag and last-check time are updated
    /// under that member's own lock.
    pub async fn check_all(&self, vhost: &Arc<Backend>) -> HealthReport {
        let members = vhost.members();
        let check_time = Utc::now();
        let started = Instant::now();

        let mut report = HealthReport {
            pass: Vec::new(),
            fail: Vec::new(),
            check_time,
            duration: Duration::ZERO,
        };

        for member in members {
            let status = self.probe_member(&member).await;
            member.record_health(status.healthy, Utc::now());
            if status.healthy {
                report.pass.push(status);
            } else {
                report.fail.push(status);
            }
        }

        report.duration = started.elapsed();
        report
    }

    /// Check the named balancing member of `vhost`.
    pub async fn check_one(&self, vhost: &Arc<Backend>, name: &str) -> anyhow::Result<MemberStatus> {
        if name.is_empty() {
            anyhow::bail!("empty server name");
        }
        let member = vhost
            .member(name)
            .ok_or_else(|| anyhow::anyhow!("no server found for name {:?}", name))?;
        let status = self.probe_member(&member).await;
        member.record_health(status.healthy, Utc::now());
        Ok(status)
    }

    /// Check the virtual host's own upstream without recording the result.
    pub async fn check_self(&self, backend: &Arc<Backend>) -> MemberStatus {
        self.probe_member(backend).await
    }

    async fn probe_member(&self, member: &Arc<Backend>) -> MemberStatus {
        let url = match member.resolved_url() {
            Ok(url) => url,
            Err(e) => {
                warn!(member = %member.name, error = %e, "health check skipped, bad URL");
                return MemberStatus {
                    name: member.name.clone(),
                    url: String::new(),
                    healthy: false,
                };
            }
        };
        let healthy = self.probe(&url, &member.name).await;
        MemberStatus {
            name: member.name.clone(),
            url,
            healthy,
        }
    }

    /// GET the URL and classify the outcome.
    async fn probe(&self, url: &str, name: &str) -> bool {
        let request = match Request::builder()
            .method("GET")
            .uri(url)
            .body(Empty::<Bytes>::new())
        {
            Ok(request) => request,
            Err(e) => {
                warn!(member = %name, error = %e, "health check request build failed");
                return false;
            }
        };

        let response =
            match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.client.request(request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    debug!(member = %name, error = %e, "health check transport failure");
                    return false;
                }
                Err(_) => {
                    debug!(member = %name, "health check timed out");
                    return false;
                }
            };

        let status = response.status();
        if status.as_u16() < 400 {
            debug!(member = %name, status = %status, "health check passed");
            return true;
        }

        let body = read_diagnostic_body(response.into_body()).await;
        warn!(
            member = %name,
            status = %status,
            body = %String::from_utf8_lossy(&body),
            "health check failed"
        );
        false
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_diagnostic_body(mut body: hyper::body::Incoming) -> Vec<u8> {
    let mut collected = Vec::new();
    while let Some(next) = body.frame().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(_) => break,
        };
        if let Some(data) = frame.data_ref() {
            collected.extend_from_slice(data);
            if collected.len() >= MAX_DIAGNOSTIC_BODY {
                collected.truncate(MAX_DIAGNOSTIC_BODY);
                break;
            }
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerSpec;

    fn vhost_with_members(urls: &[(&str, &str)]) -> Arc<Backend> {
        Arc::new(Backend::from_spec(&ServerSpec {
            name: "lb".to_string(),
            url: "http://127.0.0.1:1".to_string(),
            balance: urls
                .iter()
                .map(|(name, url)| ServerSpec {
                    name: name.to_string(),
                    url: url.to_string(),
                    is_healthy: true,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }))
    }

    async fn spawn_status_server(status: u16) -> std::net::SocketAddr {
        use http_body_util::Full;
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(move |_req| async move {
                        Ok::<_, hyper::Error>(
                            hyper::Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from_static(b"body")))
                                .unwrap(),
                        )
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_check_all_partitions_members() {
        let ok = spawn_status_server(200).await;
        let bad = spawn_status_server(500).await;
        let vhost = vhost_with_members(&[
            ("good", &format!("http://{}", ok)),
            ("bad", &format!("http://{}", bad)),
        ]);

        let checker = HealthChecker::new();
        let report = checker.check_all(&vhost).await;

        assert_eq!(report.pass.len(), 1);
        assert_eq!(report.pass[0].name, "good");
        assert_eq!(report.fail.len(), 1);
        assert_eq!(report.fail[0].name, "bad");

        assert!(vhost.member("good").unwrap().is_healthy());
        assert!(!vhost.member("bad").unwrap().is_healthy());
        assert!(vhost.member("bad").unwrap().last_health_check().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_member_is_unhealthy() {
        // Nothing listens on this port.
        let vhost = vhost_with_members(&[("down", "http://127.0.0.1:1")]);
        let checker = HealthChecker::new();
        let report = checker.check_all(&vhost).await;
        assert!(report.pass.is_empty());
        assert_eq!(report.fail.len(), 1);
        assert!(!vhost.member("down").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_check_one_targets_named_member() {
        let ok = spawn_status_server(204).await;
        let vhost = vhost_with_members(&[("target", &format!("http://{}", ok))]);
        let checker = HealthChecker::new();

        let status = checker.check_one(&vhost, "target").await.unwrap();
        assert!(status.healthy);

        assert!(checker.check_one(&vhost, "missing").await.is_err());
        assert!(checker.check_one(&vhost, "").await.is_err());
    }

    #[tokio::test]
    async fn test_redirect_status_counts_as_healthy() {
        let addr = spawn_status_server(302).await;
        let vhost = vhost_with_members(&[("redirects", &format!("http://{}", addr))]);
        let checker = HealthChecker::new();
        let report = checker.check_all(&vhost).await;
        assert_eq!(report.pass.len(), 1);
    }

    #[test]
    fn test_report_serializes() {
        let report = HealthReport {
            pass: vec![MemberStatus {
                name: "s1".to_string(),
                url: "u1".to_string(),
                healthy: true,
            }],
            fail: vec![MemberStatus {
                name: "s2".to_string(),
                url: "u2".to_string(),
                healthy: false,
            }],
            check_time: Utc::now(),
            duration: Duration::from_secs(1),
        };
        let json = report.to_json().unwrap();
        assert!(json.contains("s1"));
        assert!(json.contains("s2"));
    }
}
