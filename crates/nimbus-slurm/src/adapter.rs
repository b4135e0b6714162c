// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! SLURM `ComputeProvider` implementation.
//!
//! All cluster interaction goes through [`SshExecutor`]: a per-job
//! workspace under `workspace_root` on the shared filesystem, a
//! generated batch script, and `sbatch`/`scancel`/`scontrol` commands.
//! The backend-native id is the numeric SLURM job id parsed from sbatch
//! stdout; a submission that produces no id is a failure regardless of
//! exit code.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::sbatch::{build_script, format_slurm_time, parse_sbatch_output, sbatch_command};
use crate::ssh::{SshError, SshExecutor};
use nimbus_core::catalog::{ApplicationCache, CatalogSource};
use nimbus_core::job::{Job, ProviderKind};
use nimbus_core::provider::{
    CancelToken, ComputeProvider, LogSink, ProviderCapabilities, ProviderError,
};
use nimbus_core::staging::CappedReader;

/// SLURM adapter configuration.
#[derive(Debug, Clone)]
pub struct SlurmConfig {
    /// Shared filesystem root for per-job workspaces.
    pub workspace_root: String,
    /// Machine classes this cluster serves.
    pub reservations: Vec<String>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            workspace_root: "/scratch/nimbus".to_string(),
            reservations: Vec::new(),
        }
    }
}

/// Compute provider backed by a SLURM cluster over SSH.
pub struct SlurmProvider {
    ssh: Arc<dyn SshExecutor>,
    config: SlurmConfig,
    catalog: ApplicationCache,
}

fn map_ssh_err(err: SshError) -> ProviderError {
    match err {
        SshError::Connect { .. } => ProviderError::Unreachable(err.to_string()),
        other => ProviderError::Other(other.to_string()),
    }
}

impl SlurmProvider {
    /// Create an adapter over an SSH executor.
    pub fn new(
        ssh: Arc<dyn SshExecutor>,
        config: SlurmConfig,
        catalog: Arc<dyn CatalogSource>,
    ) -> Self {
        Self {
            ssh,
            config,
            catalog: ApplicationCache::new(catalog),
        }
    }

    fn workspace(&self, job_id: &str) -> String {
        format!("{}/{}", self.config.workspace_root, job_id)
    }

    /// Require the SLURM job id a previous `create` assigned.
    fn native_id(job: &Job) -> Result<&str, ProviderError> {
        job.provider_job_id
            .as_deref()
            .ok_or_else(|| ProviderError::Other("job was never handed to SLURM".to_string()))
    }

    async fn run_checked(&self, command: &str) -> Result<String, ProviderError> {
        let output = self.ssh.run(command).await.map_err(map_ssh_err)?;
        if output.exit_code != 0 {
            return Err(ProviderError::Rejected(format!(
                "'{}' exited {}: {}",
                command,
                output.exit_code,
                output.stdout.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ComputeProvider for SlurmProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Slurm
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            log_streaming: false,
            time_extension: true,
            suspension: true,
            reservations: self.config.reservations.clone(),
        }
    }

    async fn create(&self, job: &Job) -> Result<String, ProviderError> {
        let descriptor = self
            .catalog
            .lookup(&job.application.name, &job.application.version)
            .await
            .map_err(|e| ProviderError::Other(e.to_string()))?
            .ok_or_else(|| {
                ProviderError::Rejected(format!("unknown application {}", job.application))
            })?;

        let workspace = self.workspace(&job.id);
        self.run_checked(&format!("mkdir -p {}", workspace)).await?;

        let script = build_script(job, &descriptor, &workspace);
        let script_path = format!("{}/job.sh", workspace);
        self.ssh
            .upload(&script_path, 0o700, script.into_bytes())
            .await
            .map_err(map_ssh_err)?;

        let reservation = Some(job.reservation.name.as_str()).filter(|name| !name.is_empty());
        let command = sbatch_command(&script_path, reservation);
        let output = self.ssh.run(&command).await.map_err(map_ssh_err)?;

        let result = parse_sbatch_output(output.exit_code, &output.stdout);
        if result.exit_code != 0 {
            return Err(ProviderError::Rejected(format!(
                "sbatch exited {}: {}",
                result.exit_code,
                output.stdout.trim()
            )));
        }
        let Some(slurm_id) = result.job_id else {
            // Exit code 0 without the submission pattern is still a failure.
            return Err(ProviderError::MissingJobId {
                output: output.stdout,
            });
        };

        info!(job_id = %job.id, slurm_id, "Submitted batch job");
        Ok(slurm_id.to_string())
    }

    async fn delete(&self, job: &Job) -> Result<(), ProviderError> {
        let Some(slurm_id) = job.provider_job_id.as_deref() else {
            debug!(job_id = %job.id, "Job was never submitted, nothing to cancel");
            return Ok(());
        };
        self.run_checked(&format!("scancel {}", slurm_id)).await?;
        info!(job_id = %job.id, slurm_id, "Cancelled batch job");
        Ok(())
    }

    async fn extend(&self, job: &Job, additional: Duration) -> Result<(), ProviderError> {
        let slurm_id = Self::native_id(job)?;
        self.run_checked(&format!(
            "scontrol update JobId={} TimeLimit=+{}",
            slurm_id,
            format_slurm_time(additional)
        ))
        .await?;
        info!(job_id = %job.id, slurm_id, "Extended time limit");
        Ok(())
    }

    async fn suspend(&self, job: &Job) -> Result<(), ProviderError> {
        let slurm_id = Self::native_id(job)?;
        self.run_checked(&format!("scontrol suspend {}", slurm_id))
            .await?;
        info!(job_id = %job.id, slurm_id, "Suspended batch job");
        Ok(())
    }

    async fn follow_logs(
        &self,
        job: &Job,
        _sink: LogSink,
        _cancel: CancelToken,
    ) -> Result<(), ProviderError> {
        // Output lands in stdout.txt/stderr.txt in the workspace; there is
        // no live stream over sacct.
        debug!(job_id = %job.id, "SLURM does not stream logs");
        Ok(())
    }

    async fn stage_file(
        &self,
        job: &Job,
        parameter: &str,
        length: u64,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, ProviderError> {
        let mut capped = CappedReader::new(reader, length);
        let mut data = Vec::with_capacity(length.min(1 << 20) as usize);
        capped.read_to_end(&mut data).await?;
        capped.drain().await?;

        let workspace = self.workspace(&job.id);
        self.run_checked(&format!("mkdir -p {}", workspace)).await?;

        let written = data.len() as u64;
        self.ssh
            .upload(&format!("{}/{}", workspace, parameter), 0o600, data)
            .await
            .map_err(map_ssh_err)?;

        debug!(job_id = %job.id, parameter, written, "Staged input file");
        Ok(written)
    }

    async fn cleanup(&self, job: &Job) -> Result<(), ProviderError> {
        if let Err(e) = self.delete(job).await {
            // The job may already be gone; workspace removal still matters.
            warn!(job_id = %job.id, error = %e, "scancel during cleanup failed");
        }
        self.run_checked(&format!("rm -rf {}", self.workspace(&job.id)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::CommandOutput;
    use chrono::Utc;
    use nimbus_core::catalog::{ApplicationDescriptor, StaticCatalog};
    use nimbus_core::job::{ApplicationRef, JobState, Reservation};
    use std::sync::Mutex;

    struct ScriptedSsh {
        run_responses: Mutex<Vec<CommandOutput>>,
        commands: Mutex<Vec<String>>,
        uploads: Mutex<Vec<(String, i32, Vec<u8>)>>,
    }

    impl ScriptedSsh {
        fn new(run_responses: Vec<CommandOutput>) -> Arc<Self> {
            Arc::new(Self {
                run_responses: Mutex::new(run_responses),
                commands: Mutex::new(Vec::new()),
                uploads: Mutex::new(Vec::new()),
            })
        }

        fn ok(stdout: &str) -> CommandOutput {
            CommandOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
            }
        }
    }

    #[async_trait]
    impl SshExecutor for ScriptedSsh {
        async fn run(&self, command: &str) -> Result<CommandOutput, SshError> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(self.run_responses.lock().unwrap().remove(0))
        }

        async fn upload(&self, path: &str, mode: i32, data: Vec<u8>) -> Result<(), SshError> {
            self.uploads
                .lock()
                .unwrap()
                .push((path.to_string(), mode, data));
            Ok(())
        }
    }

    fn catalog() -> Arc<StaticCatalog> {
        Arc::new(StaticCatalog::new().with(ApplicationDescriptor {
            reference: ApplicationRef::new("blast", "2.16.0"),
            tool: "blastn".to_string(),
            output_globs: vec![],
        }))
    }

    fn test_job(reservation_name: &str) -> Job {
        Job {
            id: "j1".to_string(),
            owner: "alice".to_string(),
            project: None,
            application: ApplicationRef::new("blast", "2.16.0"),
            reservation: Reservation {
                name: reservation_name.to_string(),
                cpu: 1,
                memory_gb: 4,
                gpu: None,
            },
            nodes: 1,
            max_time: Duration::from_secs(3600),
            provider: ProviderKind::Slurm,
            state: JobState::Preparing,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            provider_job_id: None,
            output_folder: "/work/out".to_string(),
            input_files: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_submits_with_reservation_flag() {
        let ssh = ScriptedSsh::new(vec![
            ScriptedSsh::ok(""),                         // mkdir
            ScriptedSsh::ok("Submitted batch job 42\n"), // sbatch
        ]);
        let provider = SlurmProvider::new(ssh.clone(), SlurmConfig::default(), catalog());

        let native_id = provider.create(&test_job("test")).await.unwrap();
        assert_eq!(native_id, "42");

        let commands = ssh.commands.lock().unwrap();
        assert_eq!(commands[0], "mkdir -p /scratch/nimbus/j1");
        assert_eq!(
            commands[1],
            "sbatch --reservation=test /scratch/nimbus/j1/job.sh"
        );

        let uploads = ssh.uploads.lock().unwrap();
        assert_eq!(uploads[0].0, "/scratch/nimbus/j1/job.sh");
        assert_eq!(uploads[0].1, 0o700);
        let script = String::from_utf8(uploads[0].2.clone()).unwrap();
        assert!(script.contains("#SBATCH --job-name=nimbus-j1"));
    }

    #[tokio::test]
    async fn test_create_without_pattern_is_missing_job_id() {
        let ssh = ScriptedSsh::new(vec![
            ScriptedSsh::ok(""),
            ScriptedSsh::ok("asdq2weasdq"), // exit 0 but no pattern
        ]);
        let provider = SlurmProvider::new(ssh, SlurmConfig::default(), catalog());

        let err = provider.create(&test_job("test")).await.unwrap_err();
        assert!(matches!(err, ProviderError::MissingJobId { .. }));
    }

    #[tokio::test]
    async fn test_create_nonzero_exit_is_rejected() {
        let ssh = ScriptedSsh::new(vec![
            ScriptedSsh::ok(""),
            CommandOutput {
                exit_code: 42,
                stdout: "sbatch: error".to_string(),
            },
        ]);
        let provider = SlurmProvider::new(ssh, SlurmConfig::default(), catalog());

        let err = provider.create(&test_job("test")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_delete_cancels_submitted_job() {
        let ssh = ScriptedSsh::new(vec![ScriptedSsh::ok("")]);
        let provider = SlurmProvider::new(ssh.clone(), SlurmConfig::default(), catalog());

        let mut job = test_job("test");
        job.provider_job_id = Some("42".to_string());
        provider.delete(&job).await.unwrap();

        assert_eq!(ssh.commands.lock().unwrap()[0], "scancel 42");
    }

    #[tokio::test]
    async fn test_delete_unsubmitted_job_is_noop() {
        let ssh = ScriptedSsh::new(vec![]);
        let provider = SlurmProvider::new(ssh.clone(), SlurmConfig::default(), catalog());

        provider.delete(&test_job("test")).await.unwrap();
        assert!(ssh.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stage_file_caps_at_declared_length() {
        let ssh = ScriptedSsh::new(vec![ScriptedSsh::ok("")]);
        let provider = SlurmProvider::new(ssh.clone(), SlurmConfig::default(), catalog());

        let mut stream: &[u8] = b"ACGTACGTSURPLUS";
        let written = provider
            .stage_file(&test_job("test"), "query", 8, &mut stream)
            .await
            .unwrap();
        assert_eq!(written, 8);

        let uploads = ssh.uploads.lock().unwrap();
        assert_eq!(uploads[0].0, "/scratch/nimbus/j1/query");
        assert_eq!(uploads[0].2, b"ACGTACGT");
        // Bytes beyond the declared length stay in the stream.
        assert_eq!(stream, b"SURPLUS");
    }

    #[tokio::test]
    async fn test_extend_updates_time_limit() {
        let ssh = ScriptedSsh::new(vec![ScriptedSsh::ok("")]);
        let provider = SlurmProvider::new(ssh.clone(), SlurmConfig::default(), catalog());

        let mut job = test_job("test");
        job.provider_job_id = Some("42".to_string());
        provider
            .extend(&job, Duration::from_secs(1800))
            .await
            .unwrap();

        assert_eq!(
            ssh.commands.lock().unwrap()[0],
            "scontrol update JobId=42 TimeLimit=+00:30:00"
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_workspace() {
        let ssh = ScriptedSsh::new(vec![ScriptedSsh::ok(""), ScriptedSsh::ok("")]);
        let provider = SlurmProvider::new(ssh.clone(), SlurmConfig::default(), catalog());

        let mut job = test_job("test");
        job.provider_job_id = Some("42".to_string());
        provider.cleanup(&job).await.unwrap();

        let commands = ssh.commands.lock().unwrap();
        assert_eq!(commands[0], "scancel 42");
        assert_eq!(commands[1], "rm -rf /scratch/nimbus/j1");
    }
}
