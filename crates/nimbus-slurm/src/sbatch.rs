// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Batch script generation and `sbatch` output parsing.
//!
//! `sbatch` can exit 0 without actually queueing anything (for example
//! when stdout is swallowed by a login-shell banner), so the job id is
//! only trusted when the `Submitted batch job <n>` pattern is present.
//! Callers must check `job_id`, never the exit code alone.

use std::fmt::Write as _;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use nimbus_core::catalog::ApplicationDescriptor;
use nimbus_core::job::Job;

static SUBMITTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Submitted batch job (\d+)").unwrap());

/// Parsed result of an `sbatch` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbatchResult {
    /// Remote exit code.
    pub exit_code: i32,
    /// Assigned SLURM job id, when the submission pattern was present.
    pub job_id: Option<u64>,
}

/// Parse `sbatch` stdout together with its exit code.
pub fn parse_sbatch_output(exit_code: i32, stdout: &str) -> SbatchResult {
    let job_id = SUBMITTED
        .captures(stdout)
        .and_then(|captures| captures[1].parse().ok());
    SbatchResult { exit_code, job_id }
}

/// Render a duration as SLURM's `HH:MM:SS`.
pub fn format_slurm_time(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Build the `sbatch` invocation for an uploaded script.
pub fn sbatch_command(script_path: &str, reservation: Option<&str>) -> String {
    match reservation {
        Some(name) => format!("sbatch --reservation={} {}", name, script_path),
        None => format!("sbatch {}", script_path),
    }
}

/// Generate the batch script for a job.
pub fn build_script(job: &Job, descriptor: &ApplicationDescriptor, workspace: &str) -> String {
    let mut script = String::new();
    script.push_str("#!/usr/bin/env bash\n");
    let _ = writeln!(script, "#SBATCH --job-name=nimbus-{}", job.id);
    let _ = writeln!(script, "#SBATCH --chdir={}", workspace);
    let _ = writeln!(script, "#SBATCH --nodes={}", job.nodes.max(1));
    let _ = writeln!(script, "#SBATCH --cpus-per-task={}", job.reservation.cpu);
    let _ = writeln!(script, "#SBATCH --mem={}G", job.reservation.memory_gb);
    if let Some(gpu) = job.reservation.gpu {
        let _ = writeln!(script, "#SBATCH --gpus={}", gpu);
    }
    let _ = writeln!(script, "#SBATCH --time={}", format_slurm_time(job.max_time));
    let _ = writeln!(script, "#SBATCH --output={}/stdout.txt", workspace);
    let _ = writeln!(script, "#SBATCH --error={}/stderr.txt", workspace);
    script.push('\n');
    let _ = writeln!(script, "srun {}", descriptor.tool);
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nimbus_core::job::{ApplicationRef, JobState, ProviderKind, Reservation};

    #[test]
    fn test_parse_submission_success() {
        assert_eq!(
            parse_sbatch_output(0, "Submitted batch job 42\n"),
            SbatchResult {
                exit_code: 0,
                job_id: Some(42),
            }
        );
    }

    #[test]
    fn test_zero_exit_without_pattern_yields_no_id() {
        assert_eq!(
            parse_sbatch_output(0, "asdq2weasdq"),
            SbatchResult {
                exit_code: 0,
                job_id: None,
            }
        );
    }

    #[test]
    fn test_nonzero_exit_yields_no_id() {
        assert_eq!(
            parse_sbatch_output(42, "sbatch: error: invalid partition"),
            SbatchResult {
                exit_code: 42,
                job_id: None,
            }
        );
    }

    #[test]
    fn test_pattern_survives_banner_noise() {
        let stdout = "Welcome to hpc-login-01\nSubmitted batch job 1545903\n";
        assert_eq!(parse_sbatch_output(0, stdout).job_id, Some(1545903));
    }

    #[test]
    fn test_reservation_flag() {
        assert_eq!(
            sbatch_command("/tmp/job.sh", Some("test")),
            "sbatch --reservation=test /tmp/job.sh"
        );
        assert_eq!(sbatch_command("/tmp/job.sh", None), "sbatch /tmp/job.sh");
    }

    #[test]
    fn test_format_slurm_time() {
        assert_eq!(format_slurm_time(Duration::from_secs(5)), "00:00:05");
        assert_eq!(
            format_slurm_time(Duration::from_secs(10 * 3600 + 20 * 60 + 6)),
            "10:20:06"
        );
    }

    #[test]
    fn test_build_script_directives() {
        let job = Job {
            id: "j1".to_string(),
            owner: "alice".to_string(),
            project: None,
            application: ApplicationRef::new("blast", "2.16.0"),
            reservation: Reservation {
                name: "hpc-large".to_string(),
                cpu: 8,
                memory_gb: 32,
                gpu: Some(2),
            },
            nodes: 2,
            max_time: Duration::from_secs(3600),
            provider: ProviderKind::Slurm,
            state: JobState::Preparing,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            provider_job_id: None,
            output_folder: "/work/out".to_string(),
            input_files: vec![],
        };
        let descriptor = ApplicationDescriptor {
            reference: ApplicationRef::new("blast", "2.16.0"),
            tool: "blastn -query query.fa".to_string(),
            output_globs: vec![],
        };

        let script = build_script(&job, &descriptor, "/scratch/nimbus/j1");
        assert!(script.starts_with("#!/usr/bin/env bash\n"));
        assert!(script.contains("#SBATCH --job-name=nimbus-j1\n"));
        assert!(script.contains("#SBATCH --nodes=2\n"));
        assert!(script.contains("#SBATCH --cpus-per-task=8\n"));
        assert!(script.contains("#SBATCH --mem=32G\n"));
        assert!(script.contains("#SBATCH --gpus=2\n"));
        assert!(script.contains("#SBATCH --time=01:00:00\n"));
        assert!(script.contains("srun blastn -query query.fa\n"));
    }
}
