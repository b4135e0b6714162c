// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Job data model.
//!
//! A [`Job`] is one compute request. It is created by a submission call,
//! mutated only by the orchestrator in response to [`JobEvent`]s, and is
//! logically immutable once it reaches a terminal state (except for
//! cleanup bookkeeping, see [`JobState::Expired`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Execution backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Kubernetes cluster backend.
    Kubernetes,
    /// SSH-reachable SLURM scheduler backend.
    Slurm,
    /// In-memory sandbox backend (tests, dry runs).
    Sandbox,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kubernetes => write!(f, "kubernetes"),
            Self::Slurm => write!(f, "slurm"),
            Self::Sandbox => write!(f, "sandbox"),
        }
    }
}

/// Name and version of the software to run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApplicationRef {
    /// Application name as registered in the catalog.
    pub name: String,
    /// Application version.
    pub version: String,
}

impl ApplicationRef {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ApplicationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A named machine class requested at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Machine class name (e.g. "u1-standard-4").
    pub name: String,
    /// CPU cores.
    pub cpu: u32,
    /// Memory in gigabytes.
    pub memory_gb: u32,
    /// GPU count, if the class carries accelerators.
    pub gpu: Option<u32>,
}

/// Canonical job lifecycle states.
///
/// The DAG order is `InQueue < Preparing < Running < {Success, Failure}`.
/// `Expired` is cleanup bookkeeping applied on top of a terminal state and
/// is never reached through provider events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Accepted, waiting for workspace initialization.
    InQueue,
    /// Workspace verified, input files being staged.
    Preparing,
    /// Handed to the backend and executing.
    Running,
    /// Terminal: backend reported successful completion.
    Success,
    /// Terminal: backend reported failure or the job was rejected.
    Failure,
    /// Terminal job whose backend resources have been released.
    Expired,
}

impl JobState {
    /// Position in the lifecycle DAG, used to reject regressive transitions.
    pub fn rank(self) -> u8 {
        match self {
            Self::InQueue => 0,
            Self::Preparing => 1,
            Self::Running => 2,
            Self::Success | Self::Failure => 3,
            Self::Expired => 4,
        }
    }

    /// Whether no further provider-driven transitions are legal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Expired)
    }

    /// Whether `target` is a legal next state from `self`.
    ///
    /// Success/Failure are normally reached from Running, but provider
    /// rejection may fail a job straight out of InQueue or Preparing.
    pub fn can_advance_to(self, target: JobState) -> bool {
        match (self, target) {
            (Self::InQueue, Self::Preparing) => true,
            (Self::Preparing, Self::Running) => true,
            (Self::Running, Self::Success) | (Self::Running, Self::Failure) => true,
            (Self::InQueue, Self::Failure) | (Self::Preparing, Self::Failure) => true,
            (Self::Success, Self::Expired) | (Self::Failure, Self::Expired) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InQueue => "IN_QUEUE",
            Self::Preparing => "PREPARING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

impl JobState {
    /// Parse the canonical string form (inverse of `Display`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IN_QUEUE" => Some(Self::InQueue),
            "PREPARING" => Some(Self::Preparing),
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Metadata for one staged input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    /// Application parameter the file binds to.
    pub parameter: String,
    /// Destination path inside the job workspace.
    pub destination: String,
    /// Declared length in bytes.
    pub length: u64,
}

/// One compute request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique identifier, assigned at submission.
    pub id: String,
    /// Principal that submitted the job.
    pub owner: String,
    /// Project context, if the job was submitted under a project.
    pub project: Option<String>,
    /// Software to run.
    pub application: ApplicationRef,
    /// Requested machine class.
    pub reservation: Reservation,
    /// Number of nodes requested.
    pub nodes: u32,
    /// Maximum wall time requested.
    pub max_time: Duration,
    /// Backend the job was assigned to.
    pub provider: ProviderKind,
    /// Current lifecycle state.
    pub state: JobState,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When the job entered Running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Backend-native identifier (K8s Job name, SLURM numeric id).
    ///
    /// Assigned exactly once and immutable afterward. A given
    /// `(provider, provider_job_id)` pair maps to exactly one `Job.id`.
    pub provider_job_id: Option<String>,
    /// Folder the job's outputs are shipped to.
    pub output_folder: String,
    /// Staged input files (metadata only, bytes go through the adapter).
    pub input_files: Vec<InputFile>,
}

/// Normalized condition extracted from a backend status signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCondition {
    /// Condition type (e.g. "Complete", "Failed", "Running").
    pub condition_type: String,
    /// Backend-supplied reason, if any.
    pub reason: Option<String>,
}

impl JobCondition {
    /// Condition for a job the backend reports as executing.
    pub fn running() -> Self {
        Self {
            condition_type: "Running".to_string(),
            reason: None,
        }
    }

    /// Condition for successful completion.
    pub fn complete() -> Self {
        Self {
            condition_type: "Complete".to_string(),
            reason: None,
        }
    }

    /// Condition for failure with a reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            condition_type: "Failed".to_string(),
            reason: Some(reason.into()),
        }
    }

    /// Map the condition onto the target lifecycle state, if it implies one.
    pub fn target_state(&self) -> Option<JobState> {
        match self.condition_type.as_str() {
            "Running" | "Ready" => Some(JobState::Running),
            "Complete" | "SuccessCriteriaMet" => Some(JobState::Success),
            "Failed" | "FailureTarget" | "DeadlineExceeded" => Some(JobState::Failure),
            _ => None,
        }
    }
}

/// A provider-sourced signal, backend-agnostic after normalization.
///
/// `job_id` carries the backend-native identifier; the orchestrator
/// resolves it to a `Job.id` through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Backend this event originated from.
    pub provider: ProviderKind,
    /// Backend-native job identifier.
    pub provider_job_id: String,
    /// Normalized condition.
    pub condition: JobCondition,
    /// When the adapter observed the signal.
    pub observed_at: DateTime<Utc>,
}

impl JobEvent {
    /// Convenience constructor stamped with the current time.
    pub fn now(
        provider: ProviderKind,
        provider_job_id: impl Into<String>,
        condition: JobCondition,
    ) -> Self {
        Self {
            provider,
            provider_job_id: provider_job_id.into(),
            condition,
            observed_at: Utc::now(),
        }
    }
}

/// An idempotent, at-most-once billing entry created on terminal states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingRecord {
    /// Application the job ran.
    pub application: ApplicationRef,
    /// Number of nodes the job occupied.
    pub node_count: u32,
    /// Wall time consumed (completed_at - started_at).
    pub duration: Duration,
    /// Principal to bill.
    pub owner: String,
    /// Project to bill, taking precedence over `owner` when present.
    pub project: Option<String>,
    /// Job this record accounts for. Idempotence key.
    pub job_id: String,
    /// Machine class the job reserved.
    pub reservation: Reservation,
    /// When the job reached its terminal state.
    pub completed_at: DateTime<Utc>,
}
