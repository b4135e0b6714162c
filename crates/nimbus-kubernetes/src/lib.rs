// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Nimbus Kubernetes - Kubernetes provider adapter
//!
//! Runs Nimbus jobs as `batch/v1` Job objects in a dedicated namespace.
//! The adapter implements [`nimbus_core::provider::ComputeProvider`]; a
//! separate [`watcher::JobWatcher`] task normalizes Kubernetes watch
//! events into [`nimbus_core::job::JobEvent`]s on the orchestrator's
//! event channel.
//!
//! Delivery is at-least-once: the watcher re-lists all labeled Jobs on
//! every reconnect and replays their current conditions, relying on the
//! core's idempotent event application to absorb duplicates.

#![deny(missing_docs)]

/// The `ComputeProvider` implementation backed by the Kubernetes API.
pub mod adapter;

/// Background watch task translating Job status into lifecycle events.
pub mod watcher;

pub use adapter::{KubernetesConfig, KubernetesProvider};
pub use watcher::{JobWatcher, WatcherConfig};
