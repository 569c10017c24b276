//! SNI-driven certificate management
//!
//! The certificate manager is plugged into the HTTPS listener as the
//! rustls certificate resolver. Local-like names (anything containing
//! "localhost" or ending in ".test") receive cached self-signed leaves;
//! public names are delegated to the ACME subsystem. A handshake without
//! SNI is refused.

use crate::acme::AcmeStore;
use crate::events::{payload, EventBus, EventKind};
use parking_lot::RwLock;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Local-name predicate, shared with the development DNS collaborator:
/// a name is local-like iff it contains "localhost" or ends in ".test".
pub fn is_local_hostlike(name: &str) -> bool {
    let name = name.to_lowercase();
    name.contains("localhost") || name.ends_with(".test")
}

/// SNI certificate source for the HTTPS listener
pub struct CertManager {
    /// Self-signed leaves for local-like names; lives for the process
    self_store: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    acme: Option<Arc<AcmeStore>>,
    events: EventBus,
}

impl CertManager {
    pub fn new(acme: Option<Arc<AcmeStore>>, events: EventBus) -> Self {
        Self {
            self_store: RwLock::new(HashMap::new()),
            acme,
            events,
        }
    }

    /// Build the rustls server configuration backed by this manager.
    /// TLS 1.2 is the floor.
    pub fn server_config(self: &Arc<Self>) -> rustls::ServerConfig {
        rustls::ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ])
        .with_no_client_auth()
        .with_cert_resolver(Arc::clone(self) as Arc<dyn ResolvesServerCert>)
    }

    fn resolve_local(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(cert) = self.self_store.read().get(name) {
            return Some(Arc::clone(cert));
        }
        match generate_self_signed(name) {
            Ok(cert) => {
                let cert = Arc::new(cert);
                self.self_store
                    .write()
                    .insert(name.to_string(), Arc::clone(&cert));
                debug!(host = %name, "issued self-signed certificate");
                self.events.publish(
                    EventKind::CertManagerAction,
                    "self_signed_issued",
                    payload([("host", name)]),
                );
                Some(cert)
            }
            Err(e) => {
                error!(host = %name, error = %e, "self-signed generation failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for CertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertManager")
            .field("self_store", &self.self_store.read().len())
            .field("acme", &self.acme.is_some())
            .finish()
    }
}

impl ResolvesServerCert for CertManager {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = match client_hello.server_name() {
            Some(name) => name.to_lowercase(),
            None => {
                warn!("TLS handshake without SNI refused");
                return None;
            }
        };

        if is_local_hostlike(&name) {
            return self.resolve_local(&name);
        }

        match &self.acme {
            Some(acme) => acme.lookup(&name),
            None => {
                warn!(host = %name, "no ACME subsystem configured for public name");
                None
            }
        }
    }
}

/// Generate a self-signed leaf for a local-like host name: the name as CN
/// and SAN, valid from an hour ago to a year out, server-auth usage.
pub fn generate_self_signed(host: &str) -> anyhow::Result<CertifiedKey> {
    let mut params = CertificateParams::new(vec![host.to_string()])?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, host);
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + time::Duration::days(365);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("failed to serialize private key: {}", e))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("failed to create signing key: {}", e))?;

    Ok(CertifiedKey::new(vec![cert_der], signing_key))
}
