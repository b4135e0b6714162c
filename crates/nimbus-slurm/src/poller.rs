// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Background `sacct` poller.
//!
//! SLURM has no push API usable from outside the cluster, so terminal
//! states are discovered by polling `sacct` over SSH. Every poll scans
//! from the previous poll time minus a safety margin; the login node's
//! clock is not trusted to agree with ours. Overlapping windows mean
//! rows are seen more than once, which the core's idempotent event
//! application absorbs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::events::{ended_condition, is_terminal_state};
use crate::ssh::SshExecutor;
use nimbus_core::job::{JobEvent, ProviderKind};

/// Poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// How often to query sacct.
    pub poll_interval: Duration,
    /// Window extension compensating untrusted clock skew.
    pub safety_margin: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            safety_margin: Duration::from_secs(60),
        }
    }
}

/// One parsed `sacct -b -P -n` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SacctRow {
    /// A terminal row with a parseable exit code.
    Ended {
        /// SLURM numeric job id.
        job_id: u64,
        /// Terminal state string.
        state: String,
        /// Exit code from the status field.
        exit_code: i32,
    },
    /// A well-formed row for a job that has not ended yet.
    Pending,
    /// A line that does not split into exactly three fields, or whose
    /// fields do not parse.
    Malformed,
}

/// Parse one line of `sacct -b -P -n` output (`jobId|state|status`, with
/// `status` colon-delimited and the exit code first).
pub fn parse_sacct_line(line: &str) -> SacctRow {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() != 3 {
        return SacctRow::Malformed;
    }

    let Ok(job_id) = fields[0].trim().parse::<u64>() else {
        return SacctRow::Malformed;
    };
    let state = fields[1].trim();
    if !is_terminal_state(state) {
        return SacctRow::Pending;
    }

    let Some(exit_code) = fields[2]
        .split(':')
        .next()
        .and_then(|code| code.trim().parse::<i32>().ok())
    else {
        return SacctRow::Malformed;
    };

    SacctRow::Ended {
        job_id,
        state: state.to_string(),
        exit_code,
    }
}

/// The sacct command scanning for jobs that changed since `since`.
pub fn sacct_command(since: DateTime<Utc>) -> String {
    format!("sacct -b -P -n -S {}", since.format("%Y-%m-%dT%H:%M:%S"))
}

/// Background poller publishing terminal sacct rows as lifecycle events.
pub struct AccountingPoller {
    ssh: Arc<dyn SshExecutor>,
    config: PollerConfig,
    events: mpsc::Sender<JobEvent>,
    shutdown: Arc<Notify>,
}

impl AccountingPoller {
    /// Create a poller publishing into `events`.
    pub fn new(
        ssh: Arc<dyn SshExecutor>,
        config: PollerConfig,
        events: mpsc::Sender<JobEvent>,
    ) -> Self {
        Self {
            ssh,
            config,
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    ///
    /// Signal it with `notify_one` so the permit is kept when the loop is
    /// mid-poll rather than parked on the notification.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the poll loop until shutdown or the event channel closes.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "sacct poller started"
        );

        let mut last_poll = Utc::now();
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("sacct poller received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let since = last_poll
                        - chrono::Duration::from_std(self.config.safety_margin)
                            .unwrap_or(chrono::Duration::zero());
                    last_poll = Utc::now();
                    if let Err(closed) = self.poll_once(since).await {
                        if closed {
                            info!("Event channel closed");
                            break;
                        }
                    }
                }
            }
        }

        info!("sacct poller stopped");
    }

    /// One sacct scan. `Err(true)` means the event channel closed.
    async fn poll_once(&self, since: DateTime<Utc>) -> Result<(), bool> {
        let command = sacct_command(since);
        let output = match self.ssh.run(&command).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "sacct invocation failed");
                return Err(false);
            }
        };
        if output.exit_code != 0 {
            warn!(exit_code = output.exit_code, "sacct exited nonzero");
            return Err(false);
        }

        for line in output.stdout.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_sacct_line(line) {
                SacctRow::Ended {
                    job_id,
                    state,
                    exit_code,
                } => {
                    debug!(job_id, state = %state, exit_code, "Terminal sacct row");
                    let event = JobEvent::now(
                        ProviderKind::Slurm,
                        job_id.to_string(),
                        ended_condition(&state, exit_code),
                    );
                    if self.events.send(event).await.is_err() {
                        return Err(true);
                    }
                }
                SacctRow::Pending => {}
                SacctRow::Malformed => {
                    warn!(line, "Dropping malformed sacct line");
                }
            }
        }
        Ok(())
    }
}
