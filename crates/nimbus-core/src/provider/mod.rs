// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Provider adapter contract.
//!
//! Every execution backend (Kubernetes, SLURM, sandbox) implements
//! [`ComputeProvider`]. Adapters are pure execution engines - they do NOT
//! touch the job registry. State changes flow back to the orchestrator as
//! [`JobEvent`]s on a channel.

pub mod sandbox;

pub use self::sandbox::SandboxProvider;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::job::{Job, JobEvent, ProviderKind};

/// Errors from provider adapter operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The adapter does not support the requested operation.
    #[error("Operation '{operation}' not supported by this provider")]
    Unsupported {
        /// The operation that was requested.
        operation: &'static str,
    },

    /// The backend rejected the request.
    #[error("Backend rejected request: {0}")]
    Rejected(String),

    /// The backend could not be reached after bounded retries.
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The submission completed but no backend job ID was produced.
    #[error("Submission produced no job id (output: {output})")]
    MissingJobId {
        /// Raw backend output for diagnostics.
        output: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Cancellation token observed by long-lived provider operations.
pub type CancelToken = Arc<AtomicBool>;

/// Feature set a backend advertises, queried at submission time.
#[derive(Debug, Clone, Default)]
pub struct ProviderCapabilities {
    /// Whether `follow_logs` produces output.
    pub log_streaming: bool,
    /// Whether `extend` is supported.
    pub time_extension: bool,
    /// Whether `suspend` is supported.
    pub suspension: bool,
    /// Machine class names this backend can satisfy.
    pub reservations: Vec<String>,
}

impl ProviderCapabilities {
    /// Whether the backend advertises the named machine class.
    pub fn supports_reservation(&self, name: &str) -> bool {
        self.reservations.iter().any(|r| r == name)
    }
}

/// Sink for a log-follow stream.
///
/// Lines are sent as they are produced; dropping the receivers ends the
/// stream from the consumer side, the [`CancelToken`] ends it from the
/// caller side.
#[derive(Debug, Clone)]
pub struct LogSink {
    /// Stdout lines.
    pub stdout: mpsc::Sender<String>,
    /// Stderr lines.
    pub stderr: mpsc::Sender<String>,
}

/// Trait for execution backend adapters.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Which backend this adapter drives.
    fn kind(&self) -> ProviderKind;

    /// Features and machine classes this backend advertises.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Begin execution of a prepared job and return the backend-native
    /// job identifier.
    ///
    /// Must be safe to call more than once per job: backends derive their
    /// native identifiers deterministically from `job.id` (or detect the
    /// existing submission) so a retried creation is a no-op.
    async fn create(&self, job: &Job) -> Result<String>;

    /// Terminate the job and report a final status update.
    async fn delete(&self, job: &Job) -> Result<()>;

    /// Best-effort extension of the job's wall time.
    async fn extend(&self, job: &Job, additional: Duration) -> Result<()> {
        let _ = (job, additional);
        Err(ProviderError::Unsupported {
            operation: "extend",
        })
    }

    /// Pause the job without releasing its slot.
    async fn suspend(&self, job: &Job) -> Result<()> {
        let _ = job;
        Err(ProviderError::Unsupported {
            operation: "suspend",
        })
    }

    /// Stream job logs into `sink` until the job ends or `cancel` is set.
    ///
    /// Implementations must observe `cancel` at every iteration and stop
    /// within one iteration of it turning true.
    async fn follow_logs(&self, job: &Job, sink: LogSink, cancel: CancelToken) -> Result<()>;

    /// Stage one input file for the job.
    ///
    /// At most `length` bytes are consumed from `reader` and handed to the
    /// backend; any unread remainder of the declared window is drained
    /// before returning so the underlying connection can be reused. Bytes
    /// beyond `length` are left in the stream for the caller.
    async fn stage_file(
        &self,
        job: &Job,
        parameter: &str,
        length: u64,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64>;

    /// Release backend resources held by the job. Idempotent.
    async fn cleanup(&self, job: &Job) -> Result<()>;
}

/// Channel pair used by adapters to publish normalized events.
///
/// Adapters hold the sender; the orchestrator's event loop consumes the
/// receiver. This replaces backend-specific callback shapes with one
/// stream the core can `select!` over.
pub fn event_channel(capacity: usize) -> (mpsc::Sender<JobEvent>, mpsc::Receiver<JobEvent>) {
    mpsc::channel(capacity)
}
