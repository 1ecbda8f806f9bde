//! DNS propagation checking for DNS-01 challenges
//!
//! DNS propagation is not instantaneous: after publishing a challenge
//! record the pipeline must see it resolve from public recursive
//! resolvers before asking the ACME server to validate, or validation
//! fails spuriously.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::provider::{challenge_record_fqdn, DnsProviderError};

/// Configuration for propagation checking.
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Delay before the first check (lets the record start propagating)
    pub initial_delay: Duration,
    /// Interval between checks
    pub check_interval: Duration,
    /// Maximum time to wait for propagation
    pub timeout: Duration,
    /// Nameservers to query (empty = system defaults)
    pub nameservers: Vec<IpAddr>,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            check_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(600),
            nameservers: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), // Cloudflare DNS
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), // Google DNS
            ],
        }
    }
}

/// Verifies that challenge TXT records are visible before validation.
#[derive(Debug)]
pub struct PropagationChecker {
    config: PropagationConfig,
    resolver: TokioResolver,
}

impl PropagationChecker {
    /// Create a checker with default configuration.
    pub fn new() -> Result<Self, DnsProviderError> {
        Self::with_config(PropagationConfig::default())
    }

    /// Create a checker with custom configuration.
    pub fn with_config(config: PropagationConfig) -> Result<Self, DnsProviderError> {
        let resolver = Self::create_resolver(&config)?;
        Ok(Self { config, resolver })
    }

    fn create_resolver(config: &PropagationConfig) -> Result<TokioResolver, DnsProviderError> {
        let resolver_config = if config.nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut resolver_config = ResolverConfig::new();
            for ip in &config.nameservers {
                resolver_config
                    .add_name_server(NameServerConfig::new(SocketAddr::new(*ip, 53), Protocol::Udp));
            }
            resolver_config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 3;
        // Propagation checks must see live answers, not cached ones
        opts.cache_size = 0;

        let resolver =
            Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();
        Ok(resolver)
    }

    /// Wait until the challenge TXT record for `fqdn` resolves with the
    /// expected value, or the configured timeout elapses.
    pub async fn wait_for_propagation(
        &self,
        fqdn: &str,
        expected_value: &str,
    ) -> Result<(), DnsProviderError> {
        let record_name = challenge_record_fqdn(fqdn);
        let start = Instant::now();
        let deadline = start + self.config.timeout;

        debug!(
            record = %record_name,
            timeout_secs = self.config.timeout.as_secs(),
            "waiting for DNS propagation"
        );

        tokio::time::sleep(self.config.initial_delay).await;

        loop {
            match self.check_record(&record_name, expected_value).await {
                Ok(true) => {
                    debug!(
                        record = %record_name,
                        elapsed_secs = start.elapsed().as_secs(),
                        "DNS propagation confirmed"
                    );
                    return Ok(());
                }
                Ok(false) => {
                    trace!(record = %record_name, "record not yet propagated");
                }
                Err(e) => {
                    warn!(record = %record_name, error = %e, "DNS lookup error");
                }
            }

            if Instant::now() > deadline {
                return Err(DnsProviderError::PropagationTimeout {
                    record: record_name,
                    elapsed_secs: self.config.timeout.as_secs(),
                });
            }

            tokio::time::sleep(self.config.check_interval).await;
        }
    }

    /// Check whether the TXT record currently resolves with the value.
    async fn check_record(
        &self,
        record_name: &str,
        expected_value: &str,
    ) -> Result<bool, DnsProviderError> {
        match self.resolver.txt_lookup(record_name).await {
            Ok(records) => {
                for record in records.iter() {
                    // TXT records may be split into multiple strings
                    let value: String = record
                        .txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect();

                    if value == expected_value {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Err(e) => {
                // NXDOMAIN and empty answers are expected mid-propagation
                let message = e.to_string().to_lowercase();
                if message.contains("no records found")
                    || message.contains("nxdomain")
                    || message.contains("no connections available")
                    || message.contains("record not found")
                {
                    Ok(false)
                } else {
                    Err(DnsProviderError::ApiRequest(format!(
                        "DNS lookup failed for '{record_name}': {e}"
                    )))
                }
            }
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_challenge_budget() {
        let config = PropagationConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.check_interval, Duration::from_secs(30));
        assert!(!config.nameservers.is_empty());
    }

    #[tokio::test]
    async fn test_checker_creation() {
        assert!(PropagationChecker::new().is_ok());
    }

    #[tokio::test]
    async fn test_custom_config_applied() {
        let config = PropagationConfig {
            initial_delay: Duration::from_secs(1),
            check_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
            nameservers: vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))],
        };

        let checker = PropagationChecker::with_config(config).unwrap();
        assert_eq!(checker.config().check_interval, Duration::from_secs(2));
    }
}
