//! ACME certificate management for public host names
//!
//! Certificates are issued per host name, on demand: the first TLS
//! handshake for an unknown public name enqueues an HTTP-01 order while the
//! handshake is refused; once the order completes, later handshakes are
//! served from the in-memory store. Account credentials and issued
//! certificates persist in a cache directory so restarts skip the network
//! round trip.
//!
//! The CA endpoint follows a deployment environment variable named by the
//! caller: the value `production` selects the production CA, anything else
//! the staging CA.

use crate::events::{payload, EventBus, EventKind};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::{Mutex, RwLock};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::collections::{HashMap, HashSet};
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Renew when fewer than this many days of validity remain
const RENEW_BEFORE_DAYS: u64 = 30;
/// How often the renewal sweep runs
const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
/// Polling cadence and cap while an order progresses
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ORDER_POLL_ATTEMPTS: u32 = 30;

/// ACME subsystem configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// Operator contact for the CA account
    pub email: String,
    /// On-disk cache for account credentials and issued certificates
    pub cache_dir: PathBuf,
    /// Name of the environment variable that selects the CA endpoint
    pub env_key: String,
    /// Explicit directory URL; overrides the environment selection
    pub directory_url: Option<String>,
}

/// Resolve the CA directory endpoint from the deployment environment.
pub fn ca_from_env(env_key: &str) -> &'static str {
    match std::env::var(env_key) {
        Ok(value) if value == "production" => LetsEncrypt::Production.url(),
        _ => LetsEncrypt::Staging.url(),
    }
}

/// Pending HTTP-01 challenges, answered by the HTTP listener
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: String, key_authorization: String) {
        self.inner.write().insert(token, key_authorization);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.inner.read().get(token).cloned()
    }

    pub fn remove(&self, token: &str) {
        self.inner.write().remove(token);
    }
}

/// The synchronous face of the subsystem, consumed by the SNI resolver
pub struct AcmeStore {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    pending: Mutex<HashSet<String>>,
    requests: mpsc::UnboundedSender<String>,
}

impl AcmeStore {
    /// Return the cached certificate for a host, or enqueue issuance and
    /// return nothing. Duplicate handshakes do not enqueue duplicate orders.
    pub fn lookup(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(cert) = self.certs.read().get(name) {
            return Some(Arc::clone(cert));
        }
        if self.pending.lock().insert(name.to_string()) {
            debug!(host = %name, "queueing ACME issuance");
            let _ = self.requests.send(name.to_string());
        }
        None
    }

    pub fn contains(&self, name: &str) -> bool {
        self.certs.read().contains_key(name)
    }

    pub fn domains(&self) -> Vec<String> {
        self.certs.read().keys().cloned().collect()
    }

    fn install(&self, name: &str, cert: Arc<CertifiedKey>) {
        self.certs.write().insert(name.to_string(), cert);
        self.pending.lock().remove(name);
    }

    fn clear_pending(&self, name: &str) {
        self.pending.lock().remove(name);
    }

    fn current(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.read().get(name).cloned()
    }
}

/// ACME certificate manager task
pub struct AcmeManager {
    config: AcmeConfig,
    store: Arc<AcmeStore>,
    challenges: Http01Challenges,
    requests: mpsc::UnboundedReceiver<String>,
    events: EventBus,
}

impl AcmeManager {
    /// Create the manager. An unwritable cache directory is fatal.
    pub fn new(config: AcmeConfig, events: EventBus) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.cache_dir).map_err(|e| {
            anyhow::anyhow!(
                "failed to create ACME cache directory {}: {}",
                config.cache_dir.display(),
                e
            )
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&config.cache_dir, std::fs::Permissions::from_mode(0o755))?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            store: Arc::new(AcmeStore {
                certs: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashSet::new()),
                requests: tx,
            }),
            challenges: Http01Challenges::new(),
            requests: rx,
            events,
        })
    }

    pub fn store(&self) -> Arc<AcmeStore> {
        Arc::clone(&self.store)
    }

    pub fn http01_challenges(&self) -> Http01Challenges {
        self.challenges.clone()
    }

    fn directory_url(&self) -> String {
        self.config
            .directory_url
            .clone()
            .unwrap_or_else(|| ca_from_env(&self.config.env_key).to_string())
    }

    /// Run the manager: serve issuance requests and renew expiring
    /// certificates until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let account = self.get_or_create_account().await?;
        let mut renewal = tokio::time::interval_at(
            tokio::time::Instant::now() + RENEWAL_INTERVAL,
            RENEWAL_INTERVAL,
        );

        loop {
            tokio::select! {
                maybe = self.requests.recv() => match maybe {
                    Some(domain) => self.ensure_certificate(&account, &domain).await,
                    None => break,
                },
                _ = renewal.tick() => self.renew_expiring(&account).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("ACME manager shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Load or create the ACME account
    async fn get_or_create_account(&self) -> anyhow::Result<Account> {
        let account_path = self.config.cache_dir.join("account.json");

        if account_path.exists() {
            debug!(path = %account_path.display(), "loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            let account = Account::from_credentials(credentials).await?;
            return Ok(account);
        }

        let directory_url = self.directory_url();
        info!(directory = %directory_url, "creating new ACME account");

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", self.config.email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &directory_url,
            None,
        )
        .await?;

        let data = serde_json::to_string_pretty(&credentials)?;
        std::fs::write(&account_path, data)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    /// Make a certificate for `domain` available in the store, preferring
    /// the disk cache over a fresh order.
    async fn ensure_certificate(&self, account: &Account, domain: &str) {
        if self.store.contains(domain) {
            self.store.clear_pending(domain);
            return;
        }

        self.events.publish(
            EventKind::CertManagerAction,
            "renewal-start",
            payload([("host", domain)]),
        );

        if let Some((certs, key)) = self.load_cached_cert(domain) {
            match install_certified(&self.store, domain, certs, key) {
                Ok(()) => {
                    info!(host = %domain, "loaded certificate from cache");
                    self.events.publish(
                        EventKind::CertManagerAction,
                        "renewal-success",
                        payload([("host", domain), ("source", "cache")]),
                    );
                    return;
                }
                Err(e) => warn!(host = %domain, error = %e, "cached certificate unusable"),
            }
        }

        match self.obtain_certificate(account, domain).await {
            Ok((certs, key, cert_pem, key_pem)) => {
                if let Err(e) = self.save_cert(domain, &cert_pem, &key_pem) {
                    warn!(host = %domain, error = %e, "failed to persist certificate");
                }
                match install_certified(&self.store, domain, certs, key) {
                    Ok(()) => {
                        info!(host = %domain, "certificate obtained");
                        self.events.publish(
                            EventKind::CertManagerAction,
                            "renewal-success",
                            payload([("host", domain), ("source", "order")]),
                        );
                    }
                    Err(e) => {
                        error!(host = %domain, error = %e, "failed to install certificate");
                        self.store.clear_pending(domain);
                        self.events.publish(
                            EventKind::CertManagerAction,
                            "renewal-failure",
                            payload([("host", domain), ("error", e.to_string().as_str())]),
                        );
                    }
                }
            }
            Err(e) => {
                error!(host = %domain, error = %e, "certificate order failed");
                self.store.clear_pending(domain);
                self.events.publish(
                    EventKind::CertManagerAction,
                    "renewal-failure",
                    payload([("host", domain), ("error", e.to_string().as_str())]),
                );
            }
        }
    }

    /// Re-issue certificates that expire within the renewal horizon.
    async fn renew_expiring(&self, account: &Account) {
        for domain in self.store.domains() {
            let needs_renewal = self
                .store
                .current(&domain)
                .and_then(|ck| ck.cert.first().cloned())
                .map(|cert| !is_cert_valid_for_days(&cert, RENEW_BEFORE_DAYS))
                .unwrap_or(true);
            if !needs_renewal {
                continue;
            }

            info!(host = %domain, "certificate renewal needed");
            self.events.publish(
                EventKind::CertManagerAction,
                "renewal-start",
                payload([("host", domain.as_str())]),
            );
            match self.obtain_certificate(account, &domain).await {
                Ok((certs, key, cert_pem, key_pem)) => {
                    if let Err(e) = self.save_cert(&domain, &cert_pem, &key_pem) {
                        warn!(host = %domain, error = %e, "failed to persist renewed certificate");
                    }
                    match install_certified(&self.store, &domain, certs, key) {
                        Ok(()) => {
                            info!(host = %domain, "certificate renewed");
                            self.events.publish(
                                EventKind::CertManagerAction,
                                "renewal-success",
                                payload([("host", domain.as_str())]),
                            );
                        }
                        Err(e) => {
                            error!(host = %domain, error = %e, "renewed certificate unusable");
                        }
                    }
                }
                Err(e) => {
                    error!(host = %domain, error = %e, "certificate renewal failed");
                    self.events.publish(
                        EventKind::CertManagerAction,
                        "renewal-failure",
                        payload([("host", domain.as_str()), ("error", e.to_string().as_str())]),
                    );
                }
            }
        }
    }

    fn cert_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        let dir = self.config.cache_dir.join(domain);
        (dir.join("cert.pem"), dir.join("key.pem"))
    }

    /// Load a cached certificate when it is still comfortably valid
    fn load_cached_cert(
        &self,
        domain: &str,
    ) -> Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let (cert_path, key_path) = self.cert_paths(domain);
        if !cert_path.exists() || !key_path.exists() {
            return None;
        }

        let cert_data = std::fs::read(&cert_path).ok()?;
        let key_data = std::fs::read(&key_path).ok()?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(&cert_data[..]))
                .filter_map(|c| c.ok())
                .collect();
        if certs.is_empty() {
            return None;
        }

        let key = load_private_key(&key_data)?;

        if let Some(cert) = certs.first() {
            if !is_cert_valid_for_days(cert, RENEW_BEFORE_DAYS) {
                info!(host = %domain, "cached certificate expires soon, will renew");
                return None;
            }
        }

        Some((certs, key))
    }

    /// Save a certificate with a world-readable chain and 0600 key
    fn save_cert(&self, domain: &str, cert_chain_pem: &str, private_key_pem: &str) -> anyhow::Result<()> {
        let (cert_path, key_path) = self.cert_paths(domain);
        if let Some(dir) = cert_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        std::fs::write(&cert_path, cert_chain_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            std::io::Write::write_all(&mut file, private_key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&key_path, private_key_pem)?;
        }

        debug!(path = %cert_path.display(), "certificate saved to cache");
        Ok(())
    }

    /// Order a certificate for one domain via HTTP-01
    async fn obtain_certificate(
        &self,
        account: &Account,
        domain: &str,
    ) -> anyhow::Result<(
        Vec<CertificateDer<'static>>,
        PrivateKeyDer<'static>,
        String,
        String,
    )> {
        let identifiers = vec![Identifier::Dns(domain.to_string())];
        info!(host = %domain, "requesting certificate");

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    anyhow::anyhow!("HTTP-01 challenge not available for {}", identifier)
                })?;

            let key_auth = order.key_authorization(challenge);
            debug!(host = %identifier, token = %challenge.token, "setting up HTTP-01 challenge");
            self.challenges
                .set(challenge.token.clone(), key_auth.as_str().to_string());

            order.set_challenge_ready(&challenge.url).await?;

            let mut attempts = 0;
            loop {
                tokio::time::sleep(ORDER_POLL_INTERVAL).await;
                order.refresh().await?;
                let auths = order.authorizations().await?;
                let current = auths
                    .iter()
                    .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == &identifier));

                match current.map(|a| &a.status) {
                    Some(AuthorizationStatus::Valid) => {
                        debug!(host = %identifier, "authorization valid");
                        break;
                    }
                    Some(AuthorizationStatus::Pending) => {
                        attempts += 1;
                        if attempts > ORDER_POLL_ATTEMPTS {
                            self.challenges.remove(&challenge.token);
                            anyhow::bail!("authorization timeout for {}", identifier);
                        }
                    }
                    Some(AuthorizationStatus::Invalid) => {
                        self.challenges.remove(&challenge.token);
                        anyhow::bail!("authorization failed for {}", identifier);
                    }
                    Some(status) => {
                        debug!(host = %identifier, status = ?status, "authorization status");
                    }
                    None => {
                        self.challenges.remove(&challenge.token);
                        anyhow::bail!("authorization not found for {}", identifier);
                    }
                }
            }

            self.challenges.remove(&challenge.token);
        }

        // Wait for the order to become ready
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > ORDER_POLL_ATTEMPTS {
                        anyhow::bail!("order timeout for {}", domain);
                    }
                    tokio::time::sleep(ORDER_POLL_INTERVAL).await;
                    order.refresh().await?;
                }
                OrderStatus::Invalid => anyhow::bail!("order invalid for {}", domain),
            }
        }

        // Finalize with a fresh key and CSR
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domain.to_string());
        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;

        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("order valid but no certificate returned for {}", domain);
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > ORDER_POLL_ATTEMPTS {
                        anyhow::bail!("certificate timeout for {}", domain);
                    }
                    tokio::time::sleep(ORDER_POLL_INTERVAL).await;
                }
                status => anyhow::bail!("unexpected order status for {}: {:?}", domain, status),
            }
        };

        let private_key_pem = private_key.serialize_pem();

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_chain_pem.as_bytes()))
                .filter_map(|c| c.ok())
                .collect();
        let key = PrivateKeyDer::try_from(private_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("failed to parse private key: {}", e))?;

        Ok((certs, key, cert_chain_pem, private_key_pem))
    }
}

fn install_certified(
    store: &Arc<AcmeStore>,
    domain: &str,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<()> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("failed to create signing key: {}", e))?;
    store.install(domain, Arc::new(CertifiedKey::new(certs, signing_key)));
    Ok(())
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Does the certificate stay valid for at least `days` more days?
fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "failed to parse X.509 certificate");
            return false;
        }
    };

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let expiry = parsed.validity().not_after.timestamp();

    let remaining_secs = expiry - now;
    if remaining_secs < 0 {
        return false;
    }
    remaining_secs as u64 / (24 * 60 * 60) >= days
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager(dir: &std::path::Path) -> AcmeManager {
        AcmeManager::new(
            AcmeConfig {
                email: "ops@example.com".to_string(),
                cache_dir: dir.to_path_buf(),
                env_key: "MOGOLY_TEST_ENV_UNSET".to_string(),
                directory_url: None,
            },
            EventBus::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_http01_challenges() {
        let challenges = Http01Challenges::new();
        challenges.set("token123".to_string(), "key_auth_123".to_string());
        assert_eq!(challenges.get("token123"), Some("key_auth_123".to_string()));
        assert_eq!(challenges.get("nonexistent"), None);
        challenges.remove("token123");
        assert_eq!(challenges.get("token123"), None);
    }

    #[test]
    fn test_ca_from_env() {
        std::env::set_var("MOGOLY_TEST_CA_ENV", "production");
        assert_eq!(ca_from_env("MOGOLY_TEST_CA_ENV"), LetsEncrypt::Production.url());

        std::env::set_var("MOGOLY_TEST_CA_ENV", "development");
        assert_eq!(ca_from_env("MOGOLY_TEST_CA_ENV"), LetsEncrypt::Staging.url());

        std::env::remove_var("MOGOLY_TEST_CA_ENV");
        assert_eq!(ca_from_env("MOGOLY_TEST_CA_ENV"), LetsEncrypt::Staging.url());
    }

    #[test]
    fn test_lookup_miss_enqueues_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = test_manager(dir.path());
        let store = manager.store();

        assert!(store.lookup("example.com").is_none());
        assert!(store.lookup("example.com").is_none());

        // Exactly one issuance request in the queue.
        assert_eq!(
            manager.requests.try_recv().unwrap(),
            "example.com".to_string()
        );
        assert!(manager.requests.try_recv().is_err());
    }

    #[test]
    fn test_install_clears_pending_and_serves_hits() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        let store = manager.store();

        assert!(store.lookup("example.com").is_none());

        let cert = crate::tls::generate_self_signed("example.com").unwrap();
        store.install("example.com", Arc::new(cert));

        assert!(store.lookup("example.com").is_some());
        assert!(store.contains("example.com"));
        assert_eq!(store.domains(), vec!["example.com".to_string()]);
    }

    #[test]
    fn test_cache_dir_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("acme").join("cache");
        let manager = AcmeManager::new(
            AcmeConfig {
                email: "ops@example.com".to_string(),
                cache_dir: nested.clone(),
                env_key: "MOGOLY_ENV".to_string(),
                directory_url: None,
            },
            EventBus::new(),
        );
        assert!(manager.is_ok());
        assert!(nested.is_dir());
    }

    #[test]
    fn test_valid_for_days_on_fresh_self_signed() {
        let cert = crate::tls::generate_self_signed("example.com").unwrap();
        // Freshly issued with a year of validity.
        assert!(is_cert_valid_for_days(&cert.cert[0], 30));
        assert!(!is_cert_valid_for_days(&cert.cert[0], 400));
    }
}
