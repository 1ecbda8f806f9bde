//! Configuration for the Portward gateway
//!
//! Configuration is loaded from environment variables and validated
//! before any component starts. A missing or malformed required value
//! produces a [`ConfigError`] naming the offending variable; the process
//! must refuse to serve traffic in that case.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

/// Default frontend bind address.
const DEFAULT_LISTEN: &str = "0.0.0.0:443";
/// Default backend discovery polling interval.
const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(10);
/// Default renewal sweep interval (12 hours).
const DEFAULT_CERT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);
/// Default renew-before threshold in days.
const DEFAULT_RENEW_BEFORE_DAYS: u64 = 30;
/// Let's Encrypt issues 90-day certificates; a renew-before threshold at
/// or beyond that turns every issuance into an immediate renewal.
const MAX_RENEW_BEFORE_DAYS: u64 = 90;
/// Default certificate directory.
const DEFAULT_CERTS_DIR: &str = "/certs";
/// Default SSH user on the discovery host.
const DEFAULT_SSH_USER: &str = "core";
/// Default SSH identity file path (mounted into the container).
const DEFAULT_SSH_KEY: &str = "/ssh/id_rsa";

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is not set
    #[error("required environment variable {0} is not set")]
    MissingRequired(&'static str),

    /// A variable is set but cannot be parsed
    #[error("invalid value '{value}' for {variable}: {message}")]
    Invalid {
        variable: &'static str,
        value: String,
        message: String,
    },

    /// A value parsed but violates a constraint
    #[error("{variable}: {message}")]
    Constraint {
        variable: &'static str,
        message: String,
    },
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Frontend bind address
    pub listen: SocketAddr,
    /// Backend discovery polling interval
    pub update_interval: Duration,
    /// Renewal sweep interval
    pub cert_check_interval: Duration,
    /// Obtain a new certificate when expiry is within this window
    pub renew_before: Duration,
    /// Directory holding per-hostname certificates and account credentials
    pub certs_dir: PathBuf,

    /// SSH user on the discovery host
    pub ssh_user: String,
    /// SSH host running the backends
    pub ssh_host: String,
    /// SSH port on the discovery host
    pub ssh_port: u16,
    /// SSH identity file
    pub ssh_identity: PathBuf,

    /// ACME account contact email
    pub acme_email: String,
    /// Use the Let's Encrypt staging directory
    pub acme_staging: bool,
    /// Gandi LiveDNS API key
    pub gandi_api_key: String,
    /// DNS base zone challenge records are published under
    pub gandi_zone: String,
}

impl Config {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// `from_env` delegates here; tests supply a map-backed lookup so
    /// they do not mutate process state.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen = parse_var(&lookup, "PORTWARD_LISTEN", DEFAULT_LISTEN.parse().ok(), |v| {
            v.parse::<SocketAddr>().ok()
        })?;
        let update_interval = parse_var(
            &lookup,
            "PORTWARD_UPDATE_INTERVAL_SECS",
            Some(DEFAULT_UPDATE_INTERVAL),
            |v| v.parse::<u64>().ok().map(Duration::from_secs),
        )?;
        let cert_check_interval = parse_var(
            &lookup,
            "PORTWARD_CERT_CHECK_INTERVAL_SECS",
            Some(DEFAULT_CERT_CHECK_INTERVAL),
            |v| v.parse::<u64>().ok().map(Duration::from_secs),
        )?;
        let renew_before_days = parse_var(
            &lookup,
            "PORTWARD_RENEW_BEFORE_DAYS",
            Some(DEFAULT_RENEW_BEFORE_DAYS),
            |v| v.parse::<u64>().ok(),
        )?;
        if renew_before_days >= MAX_RENEW_BEFORE_DAYS {
            return Err(ConfigError::Constraint {
                variable: "PORTWARD_RENEW_BEFORE_DAYS",
                message: format!(
                    "renew-before of {renew_before_days} days must be shorter than the \
                     {MAX_RENEW_BEFORE_DAYS}-day certificate lifetime"
                ),
            });
        }
        let certs_dir = PathBuf::from(
            lookup("PORTWARD_CERTS_DIR").unwrap_or_else(|| DEFAULT_CERTS_DIR.to_string()),
        );

        let ssh_user = lookup("PODMAN_SSH_USER").unwrap_or_else(|| DEFAULT_SSH_USER.to_string());
        let ssh_host = require(&lookup, "PODMAN_SSH_HOST")?;
        let ssh_port = parse_var(&lookup, "PODMAN_SSH_PORT", None, |v| v.parse::<u16>().ok())?;
        let ssh_identity =
            PathBuf::from(lookup("PODMAN_SSH_KEY").unwrap_or_else(|| DEFAULT_SSH_KEY.to_string()));

        let acme_email = require(&lookup, "ACME_EMAIL")?;
        let acme_staging = parse_var(&lookup, "ACME_STAGING", Some(false), |v| {
            v.to_ascii_lowercase().parse::<bool>().ok()
        })?;
        let gandi_api_key = require(&lookup, "GANDI_API_KEY")?;
        let gandi_zone = require(&lookup, "GANDI_ZONE")?
            .trim()
            .trim_end_matches('.')
            .to_string();
        if gandi_zone.is_empty() {
            return Err(ConfigError::MissingRequired("GANDI_ZONE"));
        }

        let config = Self {
            listen,
            update_interval,
            cert_check_interval,
            renew_before: Duration::from_secs(renew_before_days * 24 * 3600),
            certs_dir,
            ssh_user,
            ssh_host,
            ssh_port,
            ssh_identity,
            acme_email,
            acme_staging,
            gandi_api_key,
            gandi_zone,
        };

        info!(
            listen = %config.listen,
            update_interval_secs = config.update_interval.as_secs(),
            renew_before_days,
            zone = %config.gandi_zone,
            staging = config.acme_staging,
            "configuration loaded"
        );

        Ok(config)
    }
}

/// Read a required variable, rejecting empty values.
fn require<F>(lookup: &F, variable: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(variable) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingRequired(variable)),
    }
}

/// Read an optional variable, applying `parse`; `default = None` makes it required.
fn parse_var<F, T>(
    lookup: &F,
    variable: &'static str,
    default: Option<T>,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(variable) {
        Some(value) => parse(value.trim()).ok_or_else(|| ConfigError::Invalid {
            variable,
            value,
            message: "could not parse".to_string(),
        }),
        None => default.ok_or(ConfigError::MissingRequired(variable)),
    }
}
