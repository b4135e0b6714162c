// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Nimbus Core - Compute Job Orchestration
//!
//! This crate provides the provider-agnostic orchestration core of the
//! Nimbus research cloud. It owns the job registry, the lifecycle state
//! machine, application catalog caching, and accounting ingestion. Backend
//! adapters (Kubernetes, SLURM) plug in through the [`provider`] traits
//! and report back through a single event channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       External Clients                              │
//! │              (portal, CLI, application catalog)                     │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌───────────────────────┐ control-plane calls
//! │    nimbus-core        │◄─────────────────────┐
//! │  (This Crate)         │                      │
//! │  Registry / Lifecycle │   JobEvent channel   │
//! │  Catalog / Accounting │◄─────────────┐       │
//! └──────────┬────────────┘              │       │
//!            │ ComputeProvider           │       │
//!     ┌──────┴───────┐            ┌──────┴───────┴──────┐
//!     ▼              ▼            │  watcher / poller   │
//! ┌────────────┐ ┌────────────┐   │  per backend        │
//! │ nimbus-    │ │ nimbus-    │───┘
//! │ kubernetes │ │ slurm      │
//! └────────────┘ └────────────┘
//!            │              │
//!            ▼              ▼
//! ┌────────────┐ ┌────────────┐      ┌───────────────────────┐
//! │ Kubernetes │ │ SLURM over │      │      PostgreSQL       │
//! │ API server │ │ SSH        │      │ (registry + ledger)   │
//! └────────────┘ └────────────┘      └───────────────────────┘
//! ```
//!
//! # Job Lifecycle State Machine
//!
//! ```text
//!     ┌──────────┐
//!     │ IN_QUEUE │─────────────────┐
//!     └────┬─────┘                 │
//!          │ verified              │
//!          ▼                       │ rejected
//!     ┌───────────┐               │
//!     │ PREPARING │───────────────┤
//!     └────┬──────┘                │
//!          │ handed to backend     │
//!          ▼                       ▼
//!     ┌─────────┐           ┌─────────┐
//!     │ RUNNING │──────────►│ FAILURE │
//!     └────┬────┘           └────┬────┘
//!          │ completed           │
//!          ▼                     │ cleanup
//!     ┌─────────┐                ▼
//!     │ SUCCESS │─────────►┌─────────┐
//!     └─────────┘  cleanup │ EXPIRED │
//!                          └─────────┘
//! ```
//!
//! Transitions are monotone: the registry rejects any event that would
//! move a job backwards, so at-least-once adapters can replay freely.
//! Reaching `SUCCESS` or `FAILURE` emits exactly one accounting record.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `NIMBUS_DATABASE_URL` | No | in-memory | PostgreSQL connection string |
//! | `NIMBUS_ACCOUNTING_CONSUMERS` | No | `4` | Parallel accounting batch writers |
//! | `NIMBUS_ACCOUNTING_BATCH_SIZE` | No | `1000` | Max accounting records per batch |
//! | `NIMBUS_ACCOUNTING_MAX_DELAY_MS` | No | `500` | Max delay before a partial batch flushes |
//! | `NIMBUS_QUOTA_MAX_USAGE_HOURS` | No | unlimited | Per-wallet compute quota |
//!
//! # Modules
//!
//! - [`accounting`]: Usage ledger and batched ingestion workers
//! - [`catalog`]: Application catalog cache
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types with wire error code mapping
//! - [`job`]: Job model, lifecycle states, normalized backend events
//! - [`migrations`]: Embedded PostgreSQL migrations
//! - [`orchestrator`]: Submission, control-plane calls, event loop
//! - [`provider`]: Backend adapter contract and the sandbox adapter
//! - [`registry`]: Job registry with in-memory and PostgreSQL backends
//! - [`staging`]: Length-capped input file streaming

#![deny(missing_docs)]

/// Usage ledger and batched accounting ingestion.
pub mod accounting;

/// Application catalog cache with explicit invalidation.
pub mod catalog;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for orchestration operations with wire error codes.
pub mod error;

/// Job model, lifecycle state machine, and normalized backend events.
pub mod job;

/// Embedded PostgreSQL migrations.
pub mod migrations;

/// Submission validation, control-plane handlers, and the event loop.
pub mod orchestrator;

/// Backend adapter contract plus the in-memory sandbox adapter.
pub mod provider;

/// Job registry backends (in-memory, PostgreSQL).
pub mod registry;

/// Length-capped streaming for staged input files.
pub mod staging;
