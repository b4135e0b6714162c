// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Nimbus SLURM - SLURM provider adapter
//!
//! Runs Nimbus jobs on an HPC cluster through a SLURM login node reached
//! over SSH. Submission generates a batch script, uploads it, and parses
//! `sbatch` stdout for the assigned numeric job id. A background poller
//! queries `sacct` on an interval and turns terminal accounting rows into
//! lifecycle events on the orchestrator's channel.
//!
//! SLURM speaks line-oriented text, not a structured API; every format
//! this crate parses is covered by fixture tests in its module.

#![deny(missing_docs)]

/// The `ComputeProvider` implementation driving `sbatch`/`scancel`.
pub mod adapter;

/// Parsing for SLURM notification lines (`Began`/`Ended`).
pub mod events;

/// Background `sacct` poller publishing lifecycle events.
pub mod poller;

/// Batch script generation and `sbatch` output parsing.
pub mod sbatch;

/// SSH command execution and file upload.
pub mod ssh;

pub use adapter::{SlurmConfig, SlurmProvider};
pub use events::SlurmEvent;
pub use poller::{AccountingPoller, PollerConfig};
pub use ssh::{CommandOutput, Ssh2Executor, SshCredentials, SshError, SshExecutor};
