//! Remote command transport
//!
//! Discovery shells out to `podman` on the host that runs the backends.
//! The transport is abstracted behind [`CommandTransport`] so discovery
//! logic can be tested with canned output; [`SshTransport`] is the
//! production implementation and drives the `ssh` binary through
//! `tokio::process`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors produced while running a remote command.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The local process could not be spawned or awaited
    #[error("failed to run remote command: {0}")]
    Io(#[from] std::io::Error),

    /// The remote command ran but exited unsuccessfully
    #[error("remote command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },
}

/// Executes a command on the discovery host and returns its stdout.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn run(&self, command: &str) -> Result<Vec<u8>, TransportError>;
}

/// Runs commands on the discovery host over SSH.
///
/// Uses the system `ssh` binary in batch mode: no interactive prompts,
/// key-based auth only, bounded connect timeout. Each command opens a
/// fresh connection, matching the short-lived, low-frequency usage of
/// the reconciliation loop.
#[derive(Debug, Clone)]
pub struct SshTransport {
    user: String,
    host: String,
    port: u16,
    identity: PathBuf,
}

impl SshTransport {
    pub fn new(user: &str, host: &str, port: u16, identity: PathBuf) -> Self {
        debug!(
            user = %user,
            host = %host,
            port = port,
            identity = %identity.display(),
            "SSH transport configured"
        );
        Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
            identity,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[async_trait]
impl CommandTransport for SshTransport {
    async fn run(&self, command: &str) -> Result<Vec<u8>, TransportError> {
        trace!(host = %self.host, command = %command, "running remote command");

        let output = tokio::process::Command::new("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-i")
            .arg(&self.identity)
            .arg(self.destination())
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }
}
