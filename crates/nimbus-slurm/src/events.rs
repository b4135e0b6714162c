// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! SLURM notification-line parsing.
//!
//! SLURM's MailProg/log hooks emit human-readable lines:
//!
//! ```text
//! SLURM Job_id=1545902 Name=job.sh Began, Queued time 00:20:00
//! SLURM Job_id=1547428 Name=job.sh Ended, Run time 00:00:05, COMPLETED, ExitCode 0
//! ```
//!
//! These are the only wire format carrying queue/run durations, so the
//! `HH:MM:SS` parse must be exact.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use nimbus_core::job::{JobCondition, JobEvent, ProviderKind};

static BEGAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^SLURM Job_id=(\d+) Name=(\S+) Began, Queued time (\d{2,}):(\d{2}):(\d{2})$")
        .unwrap()
});

static ENDED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^SLURM Job_id=(\d+) Name=(\S+) Ended, Run time (\d{2,}):(\d{2}):(\d{2}), ([A-Z_]+(?: by \d+)?), ExitCode (-?\d+)$",
    )
    .unwrap()
});

/// A parsed SLURM notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlurmEvent {
    /// The job left the queue and started running.
    Began {
        /// SLURM numeric job id.
        job_id: u64,
        /// Job name.
        name: String,
        /// Time spent queued.
        queued_time: Duration,
    },
    /// The job reached a terminal state.
    Ended {
        /// SLURM numeric job id.
        job_id: u64,
        /// Job name.
        name: String,
        /// Wall time consumed.
        run_time: Duration,
        /// Terminal SLURM state, e.g. `COMPLETED` or `TIMEOUT`.
        state: String,
        /// Remote exit code.
        exit_code: i32,
    },
}

/// States that end a SLURM job.
///
/// `CANCELLED` also appears as `CANCELLED by <uid>`; use
/// [`is_terminal_state`] rather than comparing against this list directly.
pub const TERMINAL_STATES: &[&str] = &[
    "COMPLETED",
    "FAILED",
    "CANCELLED",
    "TIMEOUT",
    "OUT_OF_MEMORY",
    "NODE_FAIL",
];

/// Whether a SLURM state string is terminal.
pub fn is_terminal_state(state: &str) -> bool {
    TERMINAL_STATES
        .iter()
        .any(|t| state == *t || state.starts_with(&format!("{} by ", t)))
}

/// Condition for a terminal SLURM state and exit code.
pub fn ended_condition(state: &str, exit_code: i32) -> JobCondition {
    if state == "COMPLETED" && exit_code == 0 {
        JobCondition::complete()
    } else {
        JobCondition::failed(format!("{} (exit {})", state, exit_code))
    }
}

fn duration_from_parts(hours: &str, minutes: &str, seconds: &str) -> Option<Duration> {
    let hours: u64 = hours.parse().ok()?;
    let minutes: u64 = minutes.parse().ok()?;
    let seconds: u64 = seconds.parse().ok()?;
    if minutes >= 60 || seconds >= 60 {
        return None;
    }
    Some(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
}

impl SlurmEvent {
    /// Parse one notification line. Unrecognized lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();

        if let Some(captures) = BEGAN.captures(line) {
            return Some(Self::Began {
                job_id: captures[1].parse().ok()?,
                name: captures[2].to_string(),
                queued_time: duration_from_parts(&captures[3], &captures[4], &captures[5])?,
            });
        }

        if let Some(captures) = ENDED.captures(line) {
            return Some(Self::Ended {
                job_id: captures[1].parse().ok()?,
                name: captures[2].to_string(),
                run_time: duration_from_parts(&captures[3], &captures[4], &captures[5])?,
                state: captures[6].to_string(),
                exit_code: captures[7].parse().ok()?,
            });
        }

        None
    }

    /// SLURM numeric job id.
    pub fn job_id(&self) -> u64 {
        match self {
            Self::Began { job_id, .. } | Self::Ended { job_id, .. } => *job_id,
        }
    }

    /// Normalize into the orchestrator's event model.
    pub fn to_job_event(&self) -> JobEvent {
        let condition = match self {
            Self::Began { .. } => JobCondition::running(),
            Self::Ended {
                state, exit_code, ..
            } => ended_condition(state, *exit_code),
        };
        JobEvent::now(ProviderKind::Slurm, self.job_id().to_string(), condition)
    }
}
