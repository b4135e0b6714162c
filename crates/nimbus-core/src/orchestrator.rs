// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Orchestrator core.
//!
//! Consumes normalized [`JobEvent`]s from any adapter, applies the
//! lifecycle state machine to the job registry, and on terminal states
//! emits exactly one accounting record per job.
//!
//! All event application funnels through [`Orchestrator::run`], a single
//! consumer loop over one channel. Adapters never call into the core;
//! they only publish events. Same-job duplicates are therefore serialized
//! by construction, and the registry's compare-and-advance makes them
//! harmless even when control-plane calls race the event loop.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::accounting::UsageLedger;
use crate::catalog::ApplicationCache;
use crate::error::{CoreError, Result};
use crate::job::{
    AccountingRecord, ApplicationRef, InputFile, Job, JobEvent, JobState, ProviderKind,
    Reservation,
};
use crate::provider::{CancelToken, ComputeProvider, LogSink, ProviderError};
use crate::registry::{JobRegistry, Transition};

/// A job submission request.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    /// Principal submitting the job.
    pub owner: String,
    /// Project context, if any. Billed usage attributes to the project.
    pub project: Option<String>,
    /// Application to run.
    pub application: ApplicationRef,
    /// Requested machine class.
    pub reservation: Reservation,
    /// Number of nodes.
    pub nodes: u32,
    /// Maximum wall time.
    pub max_time: Duration,
    /// Preferred backend; when None the first capable provider is used.
    pub provider: Option<ProviderKind>,
    /// Folder outputs are shipped to.
    pub output_folder: String,
    /// Declared input files (bytes arrive later via `submit_file`).
    pub input_files: Vec<InputFile>,
}

/// Compute-time quota applied at submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaPolicy {
    /// Maximum billed wall time per owner or project; None disables the
    /// check.
    pub max_usage: Option<Duration>,
}

/// The orchestrator core.
pub struct Orchestrator {
    registry: Arc<dyn JobRegistry>,
    ledger: Arc<dyn UsageLedger>,
    catalog: ApplicationCache,
    /// Registration order doubles as provider selection order.
    providers: Vec<Arc<dyn ComputeProvider>>,
    by_kind: HashMap<ProviderKind, Arc<dyn ComputeProvider>>,
    accounting_tx: mpsc::Sender<AccountingRecord>,
    quota: QuotaPolicy,
    shutdown: Arc<Notify>,
}

impl Orchestrator {
    /// Create an orchestrator with no providers registered yet.
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        ledger: Arc<dyn UsageLedger>,
        catalog: ApplicationCache,
        accounting_tx: mpsc::Sender<AccountingRecord>,
        quota: QuotaPolicy,
    ) -> Self {
        Self {
            registry,
            ledger,
            catalog,
            providers: Vec::new(),
            by_kind: HashMap::new(),
            accounting_tx,
            quota,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Register a provider adapter. Earlier registrations win when several
    /// backends advertise the same machine class.
    pub fn register_provider(&mut self, provider: Arc<dyn ComputeProvider>) {
        self.by_kind.insert(provider.kind(), provider.clone());
        self.providers.push(provider);
    }

    /// Get a handle that can be used to signal shutdown of the event loop.
    ///
    /// Signal it with `notify_one` so the permit is kept when the loop is
    /// busy applying an event rather than parked on the notification.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn provider_for(&self, kind: ProviderKind) -> Result<&Arc<dyn ComputeProvider>> {
        self.by_kind
            .get(&kind)
            .ok_or_else(|| CoreError::BackendRejected {
                provider: kind,
                reason: "provider not registered".to_string(),
            })
    }

    fn map_provider_error(kind: ProviderKind, err: ProviderError) -> CoreError {
        match err {
            ProviderError::Unsupported { operation } => CoreError::CapabilityNotSupported {
                provider: kind,
                operation,
            },
            other => CoreError::BackendRejected {
                provider: kind,
                reason: other.to_string(),
            },
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Validate and accept a job submission. Returns the new job id.
    pub async fn submit(&self, spec: JobSubmission) -> Result<String> {
        self.catalog
            .lookup(&spec.application.name, &spec.application.version)
            .await?
            .ok_or_else(|| CoreError::ValidationError {
                field: "application".to_string(),
                message: format!("unknown application {}", spec.application),
            })?;

        let provider = self.select_provider(&spec)?;
        self.enforce_quota(&spec).await?;

        let job = Job {
            id: Uuid::new_v4().to_string(),
            owner: spec.owner,
            project: spec.project,
            application: spec.application,
            reservation: spec.reservation,
            nodes: spec.nodes.max(1),
            max_time: spec.max_time,
            provider: provider.kind(),
            state: JobState::InQueue,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            provider_job_id: None,
            output_folder: spec.output_folder,
            input_files: spec.input_files,
        };

        self.registry.create_job(&job).await?;
        info!(
            job_id = %job.id,
            application = %job.application,
            provider = %job.provider,
            reservation = %job.reservation.name,
            "Job submitted"
        );
        Ok(job.id)
    }

    fn select_provider(&self, spec: &JobSubmission) -> Result<&Arc<dyn ComputeProvider>> {
        let candidates: Vec<&Arc<dyn ComputeProvider>> = match spec.provider {
            Some(kind) => self.by_kind.get(&kind).into_iter().collect(),
            None => self.providers.iter().collect(),
        };

        candidates
            .into_iter()
            .find(|p| p.capabilities().supports_reservation(&spec.reservation.name))
            .ok_or_else(|| CoreError::UnsupportedReservation {
                reservation: spec.reservation.name.clone(),
            })
    }

    async fn enforce_quota(&self, spec: &JobSubmission) -> Result<()> {
        let Some(limit) = self.quota.max_usage else {
            return Ok(());
        };
        let (wallet, used) = match &spec.project {
            Some(project) => (project.clone(), self.ledger.usage_for_project(project).await?),
            None => (spec.owner.clone(), self.ledger.usage_for_owner(&spec.owner).await?),
        };
        if used >= limit {
            return Err(CoreError::QuotaExceeded { wallet });
        }
        Ok(())
    }

    // ========================================================================
    // Control-plane calls (delivered by the call layer)
    // ========================================================================

    /// The job's workspace has been initialized: `IN_QUEUE -> PREPARING`.
    pub async fn job_verified(&self, job_id: &str) -> Result<()> {
        let job = self.require_job(job_id).await?;
        if job.state != JobState::InQueue {
            return Err(CoreError::InvalidJobState {
                job_id: job_id.to_string(),
                expected: JobState::InQueue,
                actual: job.state,
            });
        }
        match self
            .registry
            .advance_state(job_id, JobState::Preparing, Utc::now())
            .await?
        {
            Transition::Applied { .. } | Transition::Duplicate => Ok(()),
            Transition::Rejected { current } => Err(CoreError::InvalidJobState {
                job_id: job_id.to_string(),
                expected: JobState::InQueue,
                actual: current,
            }),
        }
    }

    /// Stage one input file for a preparing job.
    ///
    /// At most `length` bytes are consumed; the adapter skips any unread
    /// remainder of the declared window so bytes past it are never read
    /// into the next parameter.
    pub async fn submit_file(
        &self,
        job_id: &str,
        parameter: &str,
        length: u64,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        let job = self.require_job(job_id).await?;
        if job.state != JobState::Preparing {
            return Err(CoreError::InvalidJobState {
                job_id: job_id.to_string(),
                expected: JobState::Preparing,
                actual: job.state,
            });
        }
        let provider = self.provider_for(job.provider)?;
        provider
            .stage_file(&job, parameter, length, reader)
            .await
            .map_err(|e| Self::map_provider_error(job.provider, e))
    }

    /// All inputs staged: hand the job to its backend,
    /// `PREPARING -> RUNNING`.
    ///
    /// On backend rejection the job is failed, not left dangling.
    pub async fn job_prepared(&self, job_id: &str) -> Result<()> {
        let job = self.require_job(job_id).await?;
        if job.state != JobState::Preparing {
            return Err(CoreError::InvalidJobState {
                job_id: job_id.to_string(),
                expected: JobState::Preparing,
                actual: job.state,
            });
        }

        let provider = self.provider_for(job.provider)?;
        let native_id = match provider.create(&job).await {
            Ok(native_id) => native_id,
            Err(e) => {
                let cause = Self::map_provider_error(job.provider, e);
                warn!(job_id, error = %cause, "Backend rejected job, failing it");
                self.registry
                    .advance_state(job_id, JobState::Failure, Utc::now())
                    .await?;
                return Err(cause);
            }
        };

        if let Err(e) = self
            .registry
            .assign_provider_job_id(job_id, job.provider, &native_id)
            .await
        {
            // Duplicate native-id mappings indicate a correctness bug
            // upstream; abort the job rather than risk cross-billing.
            error!(job_id, native_id, error = %e, "Registry corruption, aborting job");
            self.registry
                .advance_state(job_id, JobState::Failure, Utc::now())
                .await?;
            return Err(e);
        }

        match self
            .registry
            .advance_state(job_id, JobState::Running, Utc::now())
            .await?
        {
            Transition::Applied { .. } | Transition::Duplicate => {
                info!(job_id, native_id, "Job handed to backend");
                Ok(())
            }
            Transition::Rejected { current } => Err(CoreError::InvalidJobState {
                job_id: job_id.to_string(),
                expected: JobState::Preparing,
                actual: current,
            }),
        }
    }

    /// Release backend resources for a job. Idempotent; terminal jobs are
    /// marked `EXPIRED`.
    pub async fn cleanup(&self, job_id: &str) -> Result<()> {
        let job = self.require_job(job_id).await?;
        let provider = self.provider_for(job.provider)?;
        provider
            .cleanup(&job)
            .await
            .map_err(|e| Self::map_provider_error(job.provider, e))?;

        if matches!(job.state, JobState::Success | JobState::Failure) {
            // Duplicate cleanup lands on Expired already; that's fine.
            let _ = self
                .registry
                .advance_state(job_id, JobState::Expired, Utc::now())
                .await?;
        }
        Ok(())
    }

    /// Open a log-follow stream for a job.
    ///
    /// Returns an empty stream (immediately) when the backend cannot
    /// stream logs; never hangs indefinitely.
    pub async fn follow(&self, job_id: &str, sink: LogSink, cancel: CancelToken) -> Result<()> {
        let job = self.require_job(job_id).await?;
        let provider = self.provider_for(job.provider)?;
        if !provider.capabilities().log_streaming {
            debug!(job_id, provider = %job.provider, "Log streaming not supported, empty stream");
            return Ok(());
        }
        if let Err(e) = provider.follow_logs(&job, sink, cancel).await {
            // A short-lived stream, not an error surfaced to the caller.
            warn!(job_id, error = %e, "Log follow ended with error");
        }
        Ok(())
    }

    /// Best-effort extension of a running job's wall time.
    pub async fn extend(&self, job_id: &str, additional: Duration) -> Result<()> {
        let job = self.require_job(job_id).await?;
        let provider = self.provider_for(job.provider)?;
        if !provider.capabilities().time_extension {
            return Err(CoreError::CapabilityNotSupported {
                provider: job.provider,
                operation: "extend",
            });
        }
        provider
            .extend(&job, additional)
            .await
            .map_err(|e| Self::map_provider_error(job.provider, e))
    }

    /// Pause a running job without releasing its slot.
    pub async fn suspend(&self, job_id: &str) -> Result<()> {
        let job = self.require_job(job_id).await?;
        let provider = self.provider_for(job.provider)?;
        if !provider.capabilities().suspension {
            return Err(CoreError::CapabilityNotSupported {
                provider: job.provider,
                operation: "suspend",
            });
        }
        provider
            .suspend(&job)
            .await
            .map_err(|e| Self::map_provider_error(job.provider, e))
    }

    /// The application catalog reported a deletion: drop cached lookups
    /// and purge registry entries referencing the retired application.
    pub async fn delete_job_information(&self, name: &str, version: &str) -> Result<()> {
        self.catalog.invalidate(name, version).await;
        let purged = self
            .registry
            .delete_for_application(&ApplicationRef::new(name, version))
            .await?;
        info!(
            application = name,
            version, purged, "Purged jobs for retired application"
        );
        Ok(())
    }

    async fn require_job(&self, job_id: &str) -> Result<Job> {
        self.registry
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    // ========================================================================
    // Event application
    // ========================================================================

    /// Apply one normalized provider event.
    ///
    /// Unknown jobs, already-terminal jobs, and regressive conditions are
    /// logged and dropped - adapters deliver at-least-once and out of
    /// order across poll cycles, so none of these are errors.
    pub async fn apply_event(&self, event: &JobEvent) -> Result<()> {
        let Some(job) = self
            .registry
            .find_by_provider_id(event.provider, &event.provider_job_id)
            .await?
        else {
            warn!(
                provider = %event.provider,
                provider_job_id = %event.provider_job_id,
                "Event for unknown job, skipping"
            );
            return Ok(());
        };

        if job.state.is_terminal() {
            debug!(job_id = %job.id, state = %job.state, "Event for terminal job, skipping");
            return Ok(());
        }

        let Some(target) = event.condition.target_state() else {
            debug!(
                job_id = %job.id,
                condition = %event.condition.condition_type,
                "Condition implies no transition, skipping"
            );
            return Ok(());
        };

        match self
            .registry
            .advance_state(&job.id, target, event.observed_at)
            .await?
        {
            Transition::Applied { job } => {
                info!(
                    job_id = %job.id,
                    state = %job.state,
                    reason = event.condition.reason.as_deref().unwrap_or(""),
                    "Job transitioned"
                );
                if matches!(job.state, JobState::Success | JobState::Failure) {
                    self.enqueue_accounting(&job).await;
                }
                Ok(())
            }
            Transition::Duplicate => {
                debug!(job_id = %job.id, target = %target, "Duplicate transition, no side effects");
                Ok(())
            }
            Transition::Rejected { current } => {
                warn!(
                    job_id = %job.id,
                    current = %current,
                    target = %target,
                    "Rejected regressive transition"
                );
                Ok(())
            }
        }
    }

    /// Enqueue exactly one accounting record for a just-terminal job.
    ///
    /// The registry transition already deduplicated; the ledger's job-id
    /// key catches any record that still slips through twice.
    async fn enqueue_accounting(&self, job: &Job) {
        let completed_at = job.completed_at.unwrap_or_else(Utc::now);
        let duration = match job.started_at {
            Some(started) => (completed_at - started)
                .to_std()
                .unwrap_or(Duration::ZERO),
            // Rejected before it ever ran.
            None => Duration::ZERO,
        };

        let record = AccountingRecord {
            application: job.application.clone(),
            node_count: job.nodes,
            duration,
            owner: job.owner.clone(),
            project: job.project.clone(),
            job_id: job.id.clone(),
            reservation: job.reservation.clone(),
            completed_at,
        };

        if self.accounting_tx.send(record).await.is_err() {
            error!(job_id = %job.id, "Accounting channel closed, record lost");
        }
    }

    /// Run the event loop: consume adapter events until the channel closes
    /// or shutdown is signalled.
    pub async fn run(&self, mut events: mpsc::Receiver<JobEvent>) {
        info!("Orchestrator event loop started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Orchestrator received shutdown signal");
                    break;
                }

                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.apply_event(&event).await {
                                error!(error = %e, "Failed to apply event");
                            }
                        }
                        None => {
                            info!("Event channel closed");
                            break;
                        }
                    }
                }
            }
        }
        info!("Orchestrator event loop stopped");
    }
}
