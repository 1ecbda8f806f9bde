//! Portward - main entry point
//!
//! Wires configuration, discovery, the certificate pipeline, and the
//! TLS frontend together and supervises them until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use portward_config::Config;
use portward_proxy::acme::dns::{GandiProvider, PropagationChecker};
use portward_proxy::acme::{AcmeClient, CertificateManager, CertificateStorage, RenewalSweep};
use portward_proxy::discovery::{DiscoverySource, PodmanDiscovery, SshTransport};
use portward_proxy::routing::{CertificateEnsurer, Reconciler, RouteResolver, RouteTable};
use portward_proxy::server::GatewayServer;
use portward_proxy::tls::{CertificateProvider, SniResolver};

/// Request timeout for DNS provider API calls.
const DNS_API_TIMEOUT: Duration = Duration::from_secs(30);
/// How long shutdown waits for in-flight certificate work.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Portward - a self-managing TLS-terminating gateway
#[derive(Parser, Debug)]
#[command(name = "portward")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Validate configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    // Fail fast on configuration problems: the error names the missing
    // or invalid variable and the process exits non-zero.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration invalid, refusing to start");
            return Err(e.into());
        }
    };

    if cli.test {
        println!("portward: configuration is valid");
        return Ok(());
    }

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    info!("starting portward");

    // Discovery over SSH to the Podman host
    let transport = SshTransport::new(
        &config.ssh_user,
        &config.ssh_host,
        config.ssh_port,
        config.ssh_identity.clone(),
    );
    let discovery: Arc<dyn DiscoverySource> = Arc::new(PodmanDiscovery::new(Arc::new(transport)));

    // Certificate pipeline
    let storage = Arc::new(
        CertificateStorage::new(&config.certs_dir)
            .context("failed to initialize certificate storage")?,
    );
    let dns_provider = Arc::new(
        GandiProvider::new(&config.gandi_api_key, &config.gandi_zone, DNS_API_TIMEOUT)
            .context("failed to initialize DNS provider")?,
    );
    let propagation = PropagationChecker::new().context("failed to initialize DNS resolver")?;
    let acme_client = Arc::new(AcmeClient::new(
        &config.acme_email,
        config.acme_staging,
        dns_provider,
        propagation,
        Arc::clone(&storage),
    ));

    // Account identity is required before serving: corrupt persisted
    // credentials or a failed registration are fatal here.
    acme_client
        .init_account()
        .await
        .context("failed to establish ACME account identity")?;

    let manager = Arc::new(CertificateManager::new(
        storage,
        acme_client,
        config.renew_before,
    ));

    // Route table and reconciliation
    let routes = Arc::new(RouteTable::new());
    let ensure_tasks = TaskTracker::new();
    let reconciler = Arc::new(Reconciler::new(
        discovery,
        Arc::clone(&routes),
        Arc::clone(&manager) as Arc<dyn CertificateEnsurer>,
        config.update_interval,
        ensure_tasks.clone(),
    ));
    let sweep = RenewalSweep::new(
        Arc::clone(&manager),
        Arc::clone(&routes),
        config.cert_check_interval,
    );

    // Frontend
    let resolver = Arc::new(SniResolver::new(
        Arc::clone(&manager) as Arc<dyn CertificateProvider>
    ));
    let server = Arc::new(GatewayServer::new(
        config.listen,
        Arc::clone(&routes) as Arc<dyn RouteResolver>,
        resolver,
    ));

    // One shutdown signal shared by every loop
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let reconciler_task = tokio::spawn(reconciler.run(shutdown.clone()));
    let sweep_task = tokio::spawn(sweep.run(shutdown.clone()));

    let result = Arc::clone(&server).run(shutdown.clone()).await;
    if let Err(ref e) = result {
        error!(error = %e, "gateway server failed");
        shutdown.cancel();
    }

    // Let the background loops observe the cancellation
    let _ = reconciler_task.await;
    let _ = sweep_task.await;

    // Bounded grace for in-flight certificate work; an abandoned DNS-01
    // record is cleaned up by the next successful cycle
    ensure_tasks.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, ensure_tasks.wait())
        .await
        .is_err()
    {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "abandoning in-flight certificate work after grace period"
        );
    }

    info!("portward shut down");
    result
}

/// Cancel the shutdown token on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!(error = %e, "failed to register SIGTERM handler");
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }

        shutdown.cancel();
    });
}
