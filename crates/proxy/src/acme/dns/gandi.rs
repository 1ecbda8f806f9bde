//! Gandi LiveDNS provider implementation
//!
//! Manages TXT records for DNS-01 challenges through the Gandi LiveDNS
//! v5 API. API documentation: <https://api.gandi.net/docs/livedns/>

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, info};

use super::provider::{
    challenge_record_fqdn, relative_record_name, DnsProvider, DnsProviderError, DnsResult,
    CHALLENGE_TTL,
};

/// Gandi LiveDNS API base URL.
const GANDI_API_BASE: &str = "https://api.gandi.net/v5/livedns";

/// Gandi LiveDNS provider.
///
/// All records are published inside one configured base zone; hostnames
/// outside that zone fail record-name derivation before any request is
/// sent.
pub struct GandiProvider {
    client: Client,
    api_key: String,
    zone: String,
    base_url: String,
    timeout: Duration,
}

impl GandiProvider {
    /// Create a new Gandi provider for a base zone.
    pub fn new(api_key: &str, zone: &str, timeout: Duration) -> DnsResult<Self> {
        Self::with_base_url(api_key, zone, GANDI_API_BASE, timeout)
    }

    fn with_base_url(
        api_key: &str,
        zone: &str,
        base_url: &str,
        timeout: Duration,
    ) -> DnsResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            DnsProviderError::Configuration(format!("failed to create HTTP client: {e}"))
        })?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            zone: zone.trim().trim_end_matches('.').to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// URL of the challenge record rrset for a hostname.
    fn record_url(&self, fqdn: &str) -> DnsResult<(String, String)> {
        let record_fqdn = challenge_record_fqdn(fqdn);
        let record_name = relative_record_name(&record_fqdn, &self.zone)?;
        let url = format!(
            "{}/domains/{}/records/{}",
            self.base_url, self.zone, record_name
        );
        Ok((url, record_name))
    }

    fn request_error(&self, e: reqwest::Error) -> DnsProviderError {
        if e.is_timeout() {
            DnsProviderError::Timeout {
                elapsed_secs: self.timeout.as_secs(),
            }
        } else {
            DnsProviderError::ApiRequest(e.to_string())
        }
    }
}

#[async_trait]
impl DnsProvider for GandiProvider {
    fn name(&self) -> &'static str {
        "gandi"
    }

    async fn publish(&self, fqdn: &str, value: &str) -> DnsResult<()> {
        let (url, record_name) = self.record_url(fqdn)?;

        debug!(record = %record_name, zone = %self.zone, "creating challenge TXT record");

        let payload = json!({
            "rrset_type": "TXT",
            "rrset_values": [value],
            "rrset_ttl": CHALLENGE_TTL,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        match response.status() {
            StatusCode::CREATED => {
                info!(record = %record_name, zone = %self.zone, "challenge TXT record created");
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                DnsProviderError::Authentication("Gandi rejected the API key".to_string()),
            ),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(DnsProviderError::RecordCreation {
                    record_name,
                    message: format!("HTTP {status}: {body}"),
                })
            }
        }
    }

    async fn cleanup(&self, fqdn: &str) -> DnsResult<()> {
        let (url, record_name) = self.record_url(fqdn)?;
        let url = format!("{url}/TXT");

        debug!(record = %record_name, zone = %self.zone, "deleting challenge TXT record");

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        match response.status() {
            // Already-gone records count as cleaned up
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                info!(record = %record_name, zone = %self.zone, "challenge TXT record removed");
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                DnsProviderError::Authentication("Gandi rejected the API key".to_string()),
            ),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(DnsProviderError::RecordDeletion {
                    record_name,
                    message: format!("HTTP {status}: {body}"),
                })
            }
        }
    }
}

impl std::fmt::Debug for GandiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GandiProvider")
            .field("zone", &self.zone)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
