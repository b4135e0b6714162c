// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Sandbox provider for testing and dry runs.
//!
//! A simple adapter that simulates job execution without talking to any
//! real backend. Jobs are tracked in memory and the test (or caller)
//! decides when they begin and end by publishing events through the
//! adapter's event sender.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, mpsc};

use super::{
    CancelToken, ComputeProvider, LogSink, ProviderCapabilities, ProviderError, Result,
};
use crate::job::{Job, JobCondition, JobEvent, ProviderKind};
use crate::staging::CappedReader;

/// Sandbox job state.
#[derive(Debug, Clone, Default)]
struct SandboxJob {
    staged_files: HashMap<String, Vec<u8>>,
    log_lines: Vec<String>,
    deleted: bool,
}

/// In-memory provider adapter.
pub struct SandboxProvider {
    jobs: Arc<Mutex<HashMap<String, SandboxJob>>>,
    events: mpsc::Sender<JobEvent>,
    /// If true, `create` rejects every job.
    pub reject_all: bool,
    /// Machine classes the sandbox advertises.
    pub reservations: Vec<String>,
}

impl SandboxProvider {
    /// Create a sandbox publishing events into `events`.
    pub fn new(events: mpsc::Sender<JobEvent>) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            events,
            reject_all: false,
            reservations: vec!["sandbox-1".to_string(), "u1-standard-1".to_string()],
        }
    }

    /// Create a sandbox that rejects every submission.
    pub fn rejecting(events: mpsc::Sender<JobEvent>) -> Self {
        Self {
            reject_all: true,
            ..Self::new(events)
        }
    }

    /// Backend-native identifier for a job. Deterministic, like the
    /// Kubernetes adapter's naming scheme.
    pub fn native_id(job_id: &str) -> String {
        format!("sandbox-{}", job_id)
    }

    /// Push a synthetic backend condition for a job, as a real backend's
    /// watcher or poller would.
    pub async fn emit_condition(&self, job_id: &str, condition: JobCondition) {
        let event = JobEvent {
            provider: ProviderKind::Sandbox,
            provider_job_id: Self::native_id(job_id),
            condition,
            observed_at: Utc::now(),
        };
        // Receiver gone means the orchestrator shut down; nothing to do.
        let _ = self.events.send(event).await;
    }

    /// Bytes staged for a parameter, if any.
    pub async fn staged_file(&self, job_id: &str, parameter: &str) -> Option<Vec<u8>> {
        let jobs = self.jobs.lock().await;
        jobs.get(job_id)?.staged_files.get(parameter).cloned()
    }

    /// Append a line to the job's simulated log output.
    pub async fn push_log_line(&self, job_id: &str, line: impl Into<String>) {
        let mut jobs = self.jobs.lock().await;
        jobs.entry(job_id.to_string())
            .or_default()
            .log_lines
            .push(line.into());
    }

    /// Whether `delete`/`cleanup` has been called for the job.
    pub async fn is_deleted(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().await;
        jobs.get(job_id).map(|j| j.deleted).unwrap_or(false)
    }
}

#[async_trait]
impl ComputeProvider for SandboxProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Sandbox
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            log_streaming: true,
            time_extension: true,
            suspension: false,
            reservations: self.reservations.clone(),
        }
    }

    async fn create(&self, job: &Job) -> Result<String> {
        if self.reject_all {
            return Err(ProviderError::Rejected(
                "sandbox configured to reject".to_string(),
            ));
        }
        let mut jobs = self.jobs.lock().await;
        // Second create for the same job is a no-op.
        jobs.entry(job.id.clone()).or_default();
        Ok(Self::native_id(&job.id))
    }

    async fn delete(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(&job.id) {
            entry.deleted = true;
        }
        drop(jobs);
        self.emit_condition(&job.id, JobCondition::failed("Deleted"))
            .await;
        Ok(())
    }

    async fn extend(&self, _job: &Job, _additional: std::time::Duration) -> Result<()> {
        Ok(())
    }

    async fn follow_logs(&self, job: &Job, sink: LogSink, cancel: CancelToken) -> Result<()> {
        let mut cursor = 0usize;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(());
            }
            let lines: Vec<String> = {
                let jobs = self.jobs.lock().await;
                match jobs.get(&job.id) {
                    Some(entry) => entry.log_lines[cursor..].to_vec(),
                    None => return Ok(()),
                }
            };
            cursor += lines.len();
            for line in lines {
                if sink.stdout.send(line).await.is_err() {
                    return Ok(());
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn stage_file(
        &self,
        job: &Job,
        parameter: &str,
        length: u64,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        let mut capped = CappedReader::new(reader, length);
        let mut bytes = Vec::with_capacity(length as usize);
        capped.read_to_end(&mut bytes).await?;
        capped.drain().await?;

        let written = bytes.len() as u64;
        let mut jobs = self.jobs.lock().await;
        jobs.entry(job.id.clone())
            .or_default()
            .staged_files
            .insert(parameter.to_string(), bytes);
        Ok(written)
    }

    async fn cleanup(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(&job.id) {
            entry.deleted = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ApplicationRef, JobState, Reservation};
    use std::time::Duration;

    fn test_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            owner: "user#1".to_string(),
            project: None,
            application: ApplicationRef::new("blast", "2.12.0"),
            reservation: Reservation {
                name: "sandbox-1".to_string(),
                cpu: 1,
                memory_gb: 4,
                gpu: None,
            },
            nodes: 1,
            max_time: Duration::from_secs(3600),
            provider: ProviderKind::Sandbox,
            state: JobState::InQueue,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            provider_job_id: Some(SandboxProvider::native_id(id)),
            output_folder: "/home/user#1/Jobs/1".to_string(),
            input_files: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (tx, _rx) = mpsc::channel(8);
        let sandbox = SandboxProvider::new(tx);
        let job = test_job("j1");
        let first = sandbox.create(&job).await.unwrap();
        let second = sandbox.create(&job).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "sandbox-j1");
    }

    #[tokio::test]
    async fn test_stage_file_caps_and_drains() {
        let (tx, _rx) = mpsc::channel(8);
        let sandbox = SandboxProvider::new(tx);
        let job = test_job("j2");
        sandbox.create(&job).await.unwrap();

        let payload = vec![1u8; 512];
        let mut reader = &payload[..];
        let written = sandbox
            .stage_file(&job, "input1", 100, &mut reader)
            .await
            .unwrap();
        assert_eq!(written, 100);
        assert_eq!(
            sandbox.staged_file("j2", "input1").await.unwrap().len(),
            100
        );
    }

    #[tokio::test]
    async fn test_follow_logs_observes_cancel() {
        let (tx, _rx) = mpsc::channel(8);
        let sandbox = Arc::new(SandboxProvider::new(tx));
        let job = test_job("j3");
        sandbox.create(&job).await.unwrap();
        sandbox.push_log_line("j3", "hello").await;

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (err_tx, _err_rx) = mpsc::channel(16);
        let cancel: CancelToken = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let follower = {
            let sandbox = sandbox.clone();
            let cancel = cancel.clone();
            let job = job.clone();
            tokio::spawn(async move {
                sandbox
                    .follow_logs(
                        &job,
                        LogSink {
                            stdout: out_tx,
                            stderr: err_tx,
                        },
                        cancel,
                    )
                    .await
            })
        };

        assert_eq!(out_rx.recv().await.unwrap(), "hello");
        cancel.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(1), follower)
            .await
            .expect("follow_logs must stop within one iteration of cancel")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejecting_sandbox() {
        let (tx, _rx) = mpsc::channel(8);
        let sandbox = SandboxProvider::rejecting(tx);
        let job = test_job("j4");
        let err = sandbox.create(&job).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }
}
