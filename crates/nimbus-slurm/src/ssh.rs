// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! SSH command execution against the SLURM login node.
//!
//! ssh2 is a blocking library, so every session runs inside
//! `spawn_blocking` with a fresh connection per operation. Connect
//! failures are retried with a bounded backoff before surfacing; command
//! failures are not retried here since sbatch and scancel are not
//! idempotent from the transport's point of view.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use tracing::{debug, warn};

/// Credentials for the SLURM login node.
#[derive(Debug, Clone)]
pub struct SshCredentials {
    /// Login node hostname or IP.
    pub host: String,
    /// SSH port (default: 22).
    pub port: u16,
    /// Username for authentication.
    pub username: String,
    /// Password (used when no private key is given).
    pub password: Option<String>,
    /// Private key in PEM format.
    pub private_key: Option<String>,
    /// Passphrase for the private key.
    pub passphrase: Option<String>,
}

/// Result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Remote exit code.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
}

/// SSH errors
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    /// TCP connect or handshake failed after bounded retries.
    #[error("connect to {host} failed: {message}")]
    Connect {
        /// Target host.
        host: String,
        /// Underlying failure.
        message: String,
    },

    /// Authentication was rejected.
    #[error("authentication failed for {username}: {message}")]
    Auth {
        /// Username that failed.
        username: String,
        /// Underlying failure.
        message: String,
    },

    /// Protocol-level failure while executing or uploading.
    #[error("ssh protocol error: {0}")]
    Protocol(String),

    /// The blocking task was cancelled.
    #[error("ssh task failed: {0}")]
    Task(String),
}

/// Command execution and upload against a remote host.
///
/// The SLURM adapter and poller only speak through this trait; tests
/// substitute scripted implementations.
#[async_trait]
pub trait SshExecutor: Send + Sync {
    /// Run a command, capturing its exit code and stdout.
    async fn run(&self, command: &str) -> Result<CommandOutput, SshError>;

    /// Write `data` to `path` on the remote host with the given mode.
    async fn upload(&self, path: &str, mode: i32, data: Vec<u8>) -> Result<(), SshError>;
}

/// ssh2-backed executor with bounded connect retries.
pub struct Ssh2Executor {
    credentials: SshCredentials,
    connect_attempts: u32,
    retry_delay: Duration,
}

impl Ssh2Executor {
    /// Create an executor for the given credentials.
    pub fn new(credentials: SshCredentials) -> Self {
        Self {
            credentials,
            connect_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }

    async fn with_session<T, F>(&self, operation: F) -> Result<T, SshError>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T, SshError> + Send + 'static,
    {
        let credentials = self.credentials.clone();
        let attempts = self.connect_attempts;
        let retry_delay = self.retry_delay;

        tokio::task::spawn_blocking(move || {
            let session = connect_with_retry(&credentials, attempts, retry_delay)?;
            operation(&session)
        })
        .await
        .map_err(|e| SshError::Task(e.to_string()))?
    }
}

fn connect_with_retry(
    credentials: &SshCredentials,
    attempts: u32,
    retry_delay: Duration,
) -> Result<Session, SshError> {
    let mut last_error = String::new();
    for attempt in 1..=attempts.max(1) {
        match connect(credentials) {
            Ok(session) => return Ok(session),
            Err(SshError::Connect { message, .. }) => {
                warn!(
                    host = %credentials.host,
                    attempt,
                    error = %message,
                    "SSH connect failed"
                );
                last_error = message;
                if attempt < attempts {
                    std::thread::sleep(retry_delay);
                }
            }
            // Auth and protocol errors do not improve with retries.
            Err(other) => return Err(other),
        }
    }
    Err(SshError::Connect {
        host: credentials.host.clone(),
        message: last_error,
    })
}

fn connect(credentials: &SshCredentials) -> Result<Session, SshError> {
    let address = format!("{}:{}", credentials.host, credentials.port);
    let tcp = TcpStream::connect(&address).map_err(|e| SshError::Connect {
        host: credentials.host.clone(),
        message: e.to_string(),
    })?;

    let mut session = Session::new().map_err(|e| SshError::Connect {
        host: credentials.host.clone(),
        message: e.to_string(),
    })?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| SshError::Connect {
        host: credentials.host.clone(),
        message: e.to_string(),
    })?;

    // Prefer the private key when one is configured.
    if let Some(key) = credentials
        .private_key
        .as_ref()
        .filter(|k| !k.trim().is_empty())
    {
        session
            .userauth_pubkey_memory(
                &credentials.username,
                None,
                key,
                credentials.passphrase.as_deref(),
            )
            .map_err(|e| SshError::Auth {
                username: credentials.username.clone(),
                message: e.to_string(),
            })?;
    } else if let Some(password) = credentials.password.as_ref().filter(|p| !p.is_empty()) {
        session
            .userauth_password(&credentials.username, password)
            .map_err(|e| SshError::Auth {
                username: credentials.username.clone(),
                message: e.to_string(),
            })?;
    } else {
        return Err(SshError::Auth {
            username: credentials.username.clone(),
            message: "no authentication method configured".to_string(),
        });
    }

    if !session.authenticated() {
        return Err(SshError::Auth {
            username: credentials.username.clone(),
            message: "authentication rejected".to_string(),
        });
    }

    Ok(session)
}

#[async_trait]
impl SshExecutor for Ssh2Executor {
    async fn run(&self, command: &str) -> Result<CommandOutput, SshError> {
        let command = command.to_string();
        debug!(command = %command, "Running remote command");

        self.with_session(move |session| {
            let mut channel = session
                .channel_session()
                .map_err(|e| SshError::Protocol(e.to_string()))?;
            channel
                .exec(&command)
                .map_err(|e| SshError::Protocol(e.to_string()))?;

            let mut stdout = String::new();
            channel
                .read_to_string(&mut stdout)
                .map_err(|e| SshError::Protocol(e.to_string()))?;
            channel
                .wait_close()
                .map_err(|e| SshError::Protocol(e.to_string()))?;
            let exit_code = channel
                .exit_status()
                .map_err(|e| SshError::Protocol(e.to_string()))?;

            Ok(CommandOutput { exit_code, stdout })
        })
        .await
    }

    async fn upload(&self, path: &str, mode: i32, data: Vec<u8>) -> Result<(), SshError> {
        let path = path.to_string();
        debug!(path = %path, bytes = data.len(), "Uploading file");

        self.with_session(move |session| {
            let mut remote = session
                .scp_send(std::path::Path::new(&path), mode, data.len() as u64, None)
                .map_err(|e| SshError::Protocol(e.to_string()))?;
            remote
                .write_all(&data)
                .map_err(|e| SshError::Protocol(e.to_string()))?;
            remote
                .send_eof()
                .map_err(|e| SshError::Protocol(e.to_string()))?;
            remote
                .wait_eof()
                .map_err(|e| SshError::Protocol(e.to_string()))?;
            remote
                .close()
                .map_err(|e| SshError::Protocol(e.to_string()))?;
            remote
                .wait_close()
                .map_err(|e| SshError::Protocol(e.to_string()))?;
            Ok(())
        })
        .await
    }
}
