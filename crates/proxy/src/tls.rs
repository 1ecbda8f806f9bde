//! TLS certificate dispatch and PEM plumbing
//!
//! Maps the hostname requested in a TLS handshake (SNI) to certificate
//! material. The certificate source is injected as a
//! [`CertificateProvider`] so the frontend never knows where material
//! comes from; in production that is the certificate lifecycle manager.
//!
//! Dispatch is strictly synchronous and local: a handshake is answered
//! from cache or persisted storage or it fails. Obtaining certificates
//! is an out-of-band concern and never happens on this path.

use std::io::Cursor;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from certificate/key parsing.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to parse certificate chain: {0}")]
    CertificateParse(String),

    #[error("failed to parse private key: {0}")]
    KeyParse(String),

    #[error("certificate/key mismatch: {0}")]
    CertKeyMismatch(String),
}

/// Errors surfaced when a handshake asks for a certificate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The client hello carried no (or an empty) server name
    #[error("client hello carried no server name")]
    InvalidSni,

    /// No cached or persisted certificate exists for the name
    #[error("no certificate available for '{fqdn}'")]
    NotFound { fqdn: String },
}

/// Synchronous certificate source consulted during TLS handshakes.
///
/// Implementations must not perform network I/O; a lookup either hits
/// local state or misses.
pub trait CertificateProvider: Send + Sync {
    /// Certificate material for a (lowercased) server name, if any.
    fn certificate(&self, server_name: &str) -> Option<Arc<CertifiedKey>>;
}

/// SNI-driven certificate selection for the TLS frontend.
///
/// Handshakes with no SNI or no matching certificate are rejected: the
/// gateway serves many unrelated hostnames and has no meaningful default
/// certificate to fall back to.
pub struct SniResolver {
    provider: Arc<dyn CertificateProvider>,
}

impl SniResolver {
    pub fn new(provider: Arc<dyn CertificateProvider>) -> Self {
        Self { provider }
    }

    /// Resolve certificate material for a requested server name.
    pub fn dispatch(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>, DispatchError> {
        let name = match server_name {
            Some(name) if !name.is_empty() => name.to_ascii_lowercase(),
            _ => return Err(DispatchError::InvalidSni),
        };

        match self.provider.certificate(&name) {
            Some(cert) => {
                debug!(sni = %name, "certificate dispatched");
                Ok(cert)
            }
            None => Err(DispatchError::NotFound { fqdn: name }),
        }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.dispatch(client_hello.server_name()) {
            Ok(cert) => Some(cert),
            Err(DispatchError::InvalidSni) => {
                warn!("rejecting handshake: client hello carried no server name");
                None
            }
            Err(DispatchError::NotFound { fqdn }) => {
                warn!(sni = %fqdn, "rejecting handshake: no certificate for requested name");
                None
            }
        }
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

/// Assemble a rustls [`CertifiedKey`] from PEM-encoded chain and key.
///
/// This is the validation gate for newly obtained and lazily loaded
/// material: anything that does not parse into a usable signing identity
/// is rejected before it can replace an existing record.
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, TlsError> {
    let mut cert_reader = Cursor::new(cert_pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateParse(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateParse(
            "no certificates found in PEM".to_string(),
        ));
    }

    let mut key_reader = Cursor::new(key_pem.as_bytes());
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| TlsError::KeyParse(e.to_string()))?
        .ok_or_else(|| TlsError::KeyParse("no private key found in PEM".to_string()))?;

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| TlsError::CertKeyMismatch(format!("failed to load private key: {e:?}")))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Extract the `notAfter` expiry from the first certificate in a PEM chain.
pub fn certificate_not_after(cert_pem: &str) -> Result<DateTime<Utc>, TlsError> {
    use x509_parser::prelude::*;

    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| TlsError::CertificateParse(format!("failed to parse PEM: {e}")))?;

    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| TlsError::CertificateParse(format!("failed to parse certificate: {e}")))?;

    let timestamp = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| TlsError::CertificateParse("invalid expiry timestamp".to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    /// Mint a self-signed certificate for a hostname.
    pub(crate) fn self_signed(fqdn: &str) -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![fqdn.to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    struct MapProvider {
        certs: HashMap<String, Arc<CertifiedKey>>,
    }

    impl CertificateProvider for MapProvider {
        fn certificate(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
            self.certs.get(server_name).cloned()
        }
    }

    fn resolver_with(fqdn: &str) -> SniResolver {
        let (cert_pem, key_pem) = self_signed(fqdn);
        let certified = certified_key_from_pem(&cert_pem, &key_pem).unwrap();
        let provider = MapProvider {
            certs: HashMap::from([(fqdn.to_string(), Arc::new(certified))]),
        };
        SniResolver::new(Arc::new(provider))
    }

    #[test]
    fn test_dispatch_empty_sni_is_invalid() {
        let resolver = resolver_with("app.example.com");

        assert_eq!(
            resolver.dispatch(Some("")).unwrap_err(),
            DispatchError::InvalidSni
        );
        assert_eq!(resolver.dispatch(None).unwrap_err(), DispatchError::InvalidSni);
    }

    #[test]
    fn test_dispatch_unknown_name_is_not_found() {
        let resolver = resolver_with("app.example.com");

        assert_eq!(
            resolver.dispatch(Some("other.example.com")).unwrap_err(),
            DispatchError::NotFound {
                fqdn: "other.example.com".to_string(),
            }
        );
    }

    #[test]
    fn test_dispatch_known_name_returns_certificate() {
        let resolver = resolver_with("app.example.com");

        assert!(resolver.dispatch(Some("app.example.com")).is_ok());
    }

    #[test]
    fn test_dispatch_is_case_insensitive() {
        let resolver = resolver_with("app.example.com");

        assert!(resolver.dispatch(Some("App.Example.COM")).is_ok());
    }

    #[test]
    fn test_certified_key_round_trip() {
        let (cert_pem, key_pem) = self_signed("app.example.com");

        let certified = certified_key_from_pem(&cert_pem, &key_pem).unwrap();
        assert_eq!(certified.cert.len(), 1);
    }

    #[test]
    fn test_certified_key_rejects_garbage() {
        assert!(certified_key_from_pem("not a cert", "not a key").is_err());

        let (cert_pem, _) = self_signed("app.example.com");
        assert!(matches!(
            certified_key_from_pem(&cert_pem, "not a key"),
            Err(TlsError::KeyParse(_))
        ));
    }

    #[test]
    fn test_certificate_not_after_parses() {
        let (cert_pem, _) = self_signed("app.example.com");

        let not_after = certificate_not_after(&cert_pem).unwrap();
        assert!(not_after > Utc::now());
    }
}
