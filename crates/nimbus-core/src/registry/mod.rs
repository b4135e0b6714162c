// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Job registry interfaces and backends.
//!
//! The registry is the persisted record of every job and the only mutable
//! shared resource in the core. Every state change goes through
//! [`JobRegistry::advance_state`], which is a compare-and-advance: callers
//! learn whether their transition applied, duplicated an earlier one, or
//! was rejected as regressive. That makes concurrently-arriving duplicate
//! events harmless without long-held locks.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryRegistry;
pub use self::postgres::PostgresRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::job::{ApplicationRef, Job, JobState, ProviderKind};

/// Outcome of a compare-and-advance state transition.
#[derive(Debug, Clone)]
pub enum Transition {
    /// The transition applied; `job` is the updated record.
    Applied {
        /// Updated job record after the transition.
        job: Job,
    },
    /// The job is already in the target state. Side effects must not fire
    /// a second time.
    Duplicate,
    /// The transition would regress the lifecycle DAG or leave a terminal
    /// state; the job is unchanged.
    Rejected {
        /// State the job is actually in.
        current: JobState,
    },
}

/// Persisted record of every job.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Insert a freshly submitted job.
    async fn create_job(&self, job: &Job) -> Result<(), CoreError>;

    /// Fetch a job by its id.
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, CoreError>;

    /// Resolve a backend-native identifier to its job.
    async fn find_by_provider_id(
        &self,
        provider: ProviderKind,
        provider_job_id: &str,
    ) -> Result<Option<Job>, CoreError>;

    /// Record the backend-native identifier for a job.
    ///
    /// Assigned exactly once: re-assigning the same value is a no-op,
    /// assigning a different value - or a value already mapped to another
    /// job - is [`CoreError::RegistryCorruption`].
    async fn assign_provider_job_id(
        &self,
        job_id: &str,
        provider: ProviderKind,
        provider_job_id: &str,
    ) -> Result<(), CoreError>;

    /// Compare-and-advance the job's lifecycle state.
    ///
    /// On a transition into Running the registry stamps `started_at`; on a
    /// terminal transition it stamps `completed_at` with `observed_at`.
    async fn advance_state(
        &self,
        job_id: &str,
        target: JobState,
        observed_at: DateTime<Utc>,
    ) -> Result<Transition, CoreError>;

    /// Jobs not yet in a terminal state.
    async fn list_active(&self) -> Result<Vec<Job>, CoreError>;

    /// Purge registry entries referencing a retired application.
    ///
    /// Returns the number of purged jobs. Cache-coherency operation, not a
    /// state transition.
    async fn delete_for_application(&self, application: &ApplicationRef)
    -> Result<u64, CoreError>;
}

/// Apply the shared transition rules to an in-memory job record.
///
/// Both backends funnel through this so the DAG semantics cannot drift
/// between them. Returns the transition outcome; on `Applied` the record
/// has been mutated (state + timestamps).
pub(crate) fn advance_in_place(
    job: &mut Job,
    target: JobState,
    observed_at: DateTime<Utc>,
) -> Transition {
    if job.state == target {
        return Transition::Duplicate;
    }
    if !job.state.can_advance_to(target) {
        return Transition::Rejected { current: job.state };
    }

    job.state = target;
    if target == JobState::Running && job.started_at.is_none() {
        job.started_at = Some(observed_at);
    }
    if matches!(target, JobState::Success | JobState::Failure) && job.completed_at.is_none() {
        job.completed_at = Some(observed_at);
    }
    Transition::Applied { job: job.clone() }
}
