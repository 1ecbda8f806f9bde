//! ACME client wrapper around instant-acme
//!
//! Drives the ACME protocol for one hostname at a time: account
//! management, order creation, DNS-01 challenge publication and
//! propagation, and certificate finalization.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace, warn};

use super::dns::{dns01_txt_value, DnsProvider, PropagationChecker};
use super::error::AcmeError;
use super::storage::CertificateStorage;

/// Let's Encrypt production directory URL.
const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL.
const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Timeout for certificate issuance after finalization.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for order readiness after challenge validation.
const ORDER_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Select the ACME directory for the configured environment.
fn directory_url(staging: bool) -> &'static str {
    if staging {
        LETSENCRYPT_STAGING
    } else {
        LETSENCRYPT_PRODUCTION
    }
}

/// Material returned by a successful obtain.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM-encoded certificate chain
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
    /// Expiry of the leaf certificate
    pub not_after: DateTime<Utc>,
}

/// External certificate authority capability.
///
/// The lifecycle manager depends on this trait rather than on the ACME
/// client directly so obtain behavior can be faked in tests.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Obtain a fresh certificate for one hostname.
    async fn obtain(&self, fqdn: &str) -> Result<IssuedCertificate, AcmeError>;
}

/// A DNS-01 challenge pending validation.
struct PendingChallenge {
    fqdn: String,
    txt_value: String,
    url: String,
}

/// ACME client for automatic certificate management.
pub struct AcmeClient {
    /// ACME account (initialized once at startup)
    account: Arc<RwLock<Option<Account>>>,
    directory: String,
    contact_email: String,
    dns: Arc<dyn DnsProvider>,
    propagation: PropagationChecker,
    storage: Arc<CertificateStorage>,
}

impl AcmeClient {
    pub fn new(
        contact_email: &str,
        staging: bool,
        dns: Arc<dyn DnsProvider>,
        propagation: PropagationChecker,
        storage: Arc<CertificateStorage>,
    ) -> Self {
        Self {
            account: Arc::new(RwLock::new(None)),
            directory: directory_url(staging).to_string(),
            contact_email: contact_email.to_string(),
            dns,
            propagation,
            storage,
        }
    }

    /// The directory endpoint this client talks to.
    pub fn directory(&self) -> &str {
        &self.directory
    }

    /// Initialize or load the ACME account.
    ///
    /// Loads persisted credentials when present, otherwise registers a
    /// new account and persists its credentials.
    ///
    /// # Errors
    ///
    /// Persisted credentials that fail to parse return
    /// [`AcmeError::CorruptAccount`]; the caller must treat this as
    /// fatal, since every subsequent issuance would fail.
    pub async fn init_account(&self) -> Result<(), AcmeError> {
        if let Some(creds_json) = self.storage.load_credentials_json()? {
            info!("loading existing ACME account from storage");

            let credentials: instant_acme::AccountCredentials = serde_json::from_str(&creds_json)
                .map_err(|e| AcmeError::CorruptAccount(e.to_string()))?;

            let account = Account::builder()
                .map_err(|e| AcmeError::AccountCreation(e.to_string()))?
                .from_credentials(credentials)
                .await
                .map_err(|e| AcmeError::CorruptAccount(e.to_string()))?;

            *self.account.write().await = Some(account);
            info!("ACME account loaded");
            return Ok(());
        }

        info!(
            email = %self.contact_email,
            directory = %self.directory,
            "registering new ACME account"
        );

        let (account, credentials) = Account::builder()
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?
            .create(
                &NewAccount {
                    contact: &[&format!("mailto:{}", self.contact_email)],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory.clone(),
                None,
            )
            .await
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;

        let creds_json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| AcmeError::AccountCreation(format!("failed to serialize credentials: {e}")))?;
        self.storage.save_credentials_json(&creds_json)?;

        *self.account.write().await = Some(account);
        info!("ACME account registered");

        Ok(())
    }

    /// Create an order for one hostname and collect its DNS-01 challenges.
    async fn create_order(&self, fqdn: &str) -> Result<(Order, Vec<PendingChallenge>), AcmeError> {
        let account_guard = self.account.read().await;
        let account = account_guard.as_ref().ok_or(AcmeError::NoAccount)?;

        let identifiers = [Identifier::Dns(fqdn.to_string())];

        info!(fqdn = %fqdn, "creating certificate order");

        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::OrderCreation(e.to_string()))?;

        let mut challenges = Vec::new();
        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| {
                AcmeError::OrderCreation(format!("failed to get authorization: {e}"))
            })?;

            let domain = match &authz.identifier().identifier {
                Identifier::Dns(domain) => domain.clone(),
                _ => continue,
            };

            debug!(domain = %domain, status = ?authz.status, "processing authorization");

            if authz.status == AuthorizationStatus::Valid {
                debug!(domain = %domain, "authorization already valid");
                continue;
            }

            let challenge = authz
                .challenge(ChallengeType::Dns01)
                .ok_or_else(|| AcmeError::NoDns01Challenge(domain.clone()))?;

            let key_authorization = challenge.key_authorization();

            challenges.push(PendingChallenge {
                txt_value: dns01_txt_value(key_authorization.as_str()),
                url: challenge.url.clone(),
                fqdn: domain,
            });
        }

        Ok((order, challenges))
    }

    /// Publish challenge records, wait for propagation, and tell the
    /// ACME server each challenge is ready.
    async fn present_challenges(
        &self,
        order: &mut Order,
        challenges: &[PendingChallenge],
    ) -> Result<(), AcmeError> {
        for challenge in challenges {
            debug!(
                fqdn = %challenge.fqdn,
                provider = %self.dns.name(),
                "publishing DNS-01 challenge record"
            );
            self.dns
                .publish(&challenge.fqdn, &challenge.txt_value)
                .await?;

            self.propagation
                .wait_for_propagation(&challenge.fqdn, &challenge.txt_value)
                .await?;
        }

        for challenge in challenges {
            self.set_challenge_ready(order, &challenge.url).await?;
        }

        Ok(())
    }

    /// Mark the challenge with the given URL as ready for validation.
    async fn set_challenge_ready(
        &self,
        order: &mut Order,
        challenge_url: &str,
    ) -> Result<(), AcmeError> {
        debug!(challenge_url = %challenge_url, "setting challenge ready");

        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| AcmeError::ChallengeValidation {
                domain: "unknown".to_string(),
                message: format!("failed to get authorization: {e}"),
            })?;

            let matching_type = authz
                .challenges
                .iter()
                .find(|c| c.url == challenge_url)
                .map(|c| c.r#type.clone());

            if let Some(challenge_type) = matching_type {
                if let Some(mut challenge) = authz.challenge(challenge_type) {
                    challenge
                        .set_ready()
                        .await
                        .map_err(|e| AcmeError::ChallengeValidation {
                            domain: "unknown".to_string(),
                            message: e.to_string(),
                        })?;
                    return Ok(());
                }
            }
        }

        Err(AcmeError::ChallengeValidation {
            domain: "unknown".to_string(),
            message: format!("challenge not found for URL: {challenge_url}"),
        })
    }

    /// Poll the order until all challenges validate.
    async fn wait_for_order_ready(&self, order: &mut Order) -> Result<(), AcmeError> {
        let deadline = tokio::time::Instant::now() + ORDER_READY_TIMEOUT;

        loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| AcmeError::OrderCreation(format!("failed to refresh order: {e}")))?;

            match state.status {
                OrderStatus::Ready => {
                    info!("order ready for finalization");
                    return Ok(());
                }
                OrderStatus::Valid => {
                    info!("order already valid");
                    return Ok(());
                }
                OrderStatus::Invalid => {
                    error!("order became invalid");
                    return Err(AcmeError::OrderCreation("order became invalid".to_string()));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout(
                            "timed out waiting for order to become ready".to_string(),
                        ));
                    }
                    trace!(status = ?state.status, "order not ready yet, waiting");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    /// Finalize the order with a fresh key and retrieve the certificate.
    async fn finalize_order(
        &self,
        order: &mut Order,
        fqdn: &str,
    ) -> Result<(String, String), AcmeError> {
        info!(fqdn = %fqdn, "finalizing certificate order");

        let cert_key = rcgen::KeyPair::generate()
            .map_err(|e| AcmeError::Finalization(format!("failed to generate key: {e}")))?;

        let params = rcgen::CertificateParams::new(vec![fqdn.to_string()])
            .map_err(|e| AcmeError::Finalization(format!("failed to create CSR params: {e}")))?;

        let csr_request = params
            .serialize_request(&cert_key)
            .map_err(|e| AcmeError::Finalization(format!("failed to serialize CSR: {e}")))?;
        let csr = csr_request.der().to_vec();

        order
            .finalize_csr(&csr)
            .await
            .map_err(|e| AcmeError::Finalization(format!("failed to finalize order: {e}")))?;

        let deadline = tokio::time::Instant::now() + FINALIZE_TIMEOUT;
        let cert_chain = loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| AcmeError::Finalization(format!("failed to refresh order: {e}")))?;

            match state.status {
                OrderStatus::Valid => {
                    let cert_chain = order.certificate().await.map_err(|e| {
                        AcmeError::Finalization(format!("failed to get certificate: {e}"))
                    })?;
                    break cert_chain.ok_or_else(|| {
                        AcmeError::Finalization("no certificate in response".to_string())
                    })?;
                }
                OrderStatus::Invalid => {
                    return Err(AcmeError::Finalization("order became invalid".to_string()));
                }
                _ => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout(
                            "timed out waiting for certificate".to_string(),
                        ));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        Ok((cert_chain, cert_key.serialize_pem()))
    }
}

#[async_trait]
impl CertificateIssuer for AcmeClient {
    async fn obtain(&self, fqdn: &str) -> Result<IssuedCertificate, AcmeError> {
        let (mut order, challenges) = self.create_order(fqdn).await?;

        // Run the challenge/finalize flow, then clean up DNS records on
        // every exit path. Cleanup is idempotent and an abandoned record
        // is harmless, so failures only warn.
        let result = async {
            self.present_challenges(&mut order, &challenges).await?;
            self.wait_for_order_ready(&mut order).await?;
            self.finalize_order(&mut order, fqdn).await
        }
        .await;

        for challenge in &challenges {
            if let Err(e) = self.dns.cleanup(&challenge.fqdn).await {
                warn!(
                    fqdn = %challenge.fqdn,
                    error = %e,
                    "failed to clean up challenge record"
                );
            }
        }

        let (cert_pem, key_pem) = result?;

        let not_after = crate::tls::certificate_not_after(&cert_pem)
            .map_err(|e| AcmeError::CertificateParse(e.to_string()))?;

        info!(fqdn = %fqdn, not_after = %not_after, "certificate issued");

        Ok(IssuedCertificate {
            cert_pem,
            key_pem,
            not_after,
        })
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory", &self.directory)
            .field(
                "has_account",
                &self
                    .account
                    .try_read()
                    .map(|a| a.is_some())
                    .unwrap_or(false),
            )
            .finish()
    }
}
