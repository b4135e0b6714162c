// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Background watch task for labeled `batch/v1` Jobs.
//!
//! The watcher runs one list-then-watch cycle at a time. The initial list
//! (repeated after every reconnect) replays the current condition of every
//! labeled Job, so events missed while disconnected are recovered. Watch
//! errors never terminate the task; it backs off, re-lists, and re-watches.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job as KubeJob;
use kube::Client;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::adapter::{JOB_ID_LABEL, ROLE_LABEL};
use nimbus_core::job::{JobCondition, JobEvent, ProviderKind};

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Namespace to watch.
    pub namespace: String,
    /// Role label value selecting Nimbus-owned Jobs.
    pub app_role: String,
    /// Delay before reconnecting after a watch failure.
    pub reconnect_backoff: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            namespace: "nimbus-app".to_string(),
            app_role: "nimbus-app".to_string(),
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

/// Normalize a Job object's status into a lifecycle event, if it carries
/// one.
///
/// The first status condition wins. A Job with active pods and no
/// conditions yet is reported as running.
pub fn condition_event(object: &KubeJob) -> Option<JobEvent> {
    let name = object.metadata.name.clone()?;

    let condition = match object
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.first())
    {
        Some(first) => JobCondition {
            condition_type: first.type_.clone(),
            reason: first.reason.clone(),
        },
        None => {
            if object.status.as_ref().and_then(|s| s.active).unwrap_or(0) > 0 {
                JobCondition::running()
            } else {
                return None;
            }
        }
    };

    Some(JobEvent {
        provider: ProviderKind::Kubernetes,
        provider_job_id: name,
        condition,
        observed_at: Utc::now(),
    })
}

/// Background task watching labeled Jobs and publishing normalized events.
pub struct JobWatcher {
    api: Api<KubeJob>,
    config: WatcherConfig,
    events: mpsc::Sender<JobEvent>,
    shutdown: Arc<Notify>,
}

impl JobWatcher {
    /// Create a watcher publishing into `events`.
    pub fn new(client: Client, config: WatcherConfig, events: mpsc::Sender<JobEvent>) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            config,
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    ///
    /// Signal it with `notify_one` so the permit is kept when the loop is
    /// mid-cycle rather than parked on the notification.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn selector(&self) -> String {
        format!("{}={}", ROLE_LABEL, self.config.app_role)
    }

    /// Run the watch loop until shutdown or the event channel closes.
    pub async fn run(&self) {
        info!(
            namespace = %self.config.namespace,
            selector = %self.selector(),
            "Job watcher started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job watcher received shutdown signal");
                    break;
                }

                result = self.cycle() => {
                    if self.events.is_closed() {
                        info!("Event channel closed");
                        break;
                    }
                    match result {
                        Ok(()) => debug!("Watch stream ended, reconnecting"),
                        Err(e) => warn!(error = %e, "Watch failed, reconnecting"),
                    }
                    tokio::time::sleep(self.config.reconnect_backoff).await;
                }
            }
        }

        info!("Job watcher stopped");
    }

    /// One list-then-watch cycle. Returns when the stream ends or errors.
    async fn cycle(&self) -> kube::Result<()> {
        let selector = self.selector();

        // Reconciliation pass: replay every labeled Job's current state.
        let list = self
            .api
            .list(&ListParams::default().labels(&selector))
            .await?;
        for object in &list.items {
            self.publish(object).await;
        }

        let resource_version = list
            .metadata
            .resource_version
            .unwrap_or_else(|| "0".to_string());
        let mut stream = self
            .api
            .watch(&WatchParams::default().labels(&selector), &resource_version)
            .await?
            .boxed();

        while let Some(event) = stream.try_next().await? {
            match event {
                WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                    self.publish(&object).await;
                }
                WatchEvent::Error(status) => {
                    // Usually an expired resourceVersion; re-list on the
                    // next cycle.
                    warn!(code = status.code, message = %status.message, "Watch error event");
                    return Ok(());
                }
                WatchEvent::Deleted(_) | WatchEvent::Bookmark(_) => {}
            }
        }
        Ok(())
    }

    async fn publish(&self, object: &KubeJob) {
        let Some(event) = condition_event(object) else {
            return;
        };
        let job_id = object
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(JOB_ID_LABEL).cloned())
            .unwrap_or_default();
        debug!(
            job_id,
            name = %event.provider_job_id,
            condition = %event.condition.condition_type,
            "Publishing job event"
        );
        if self.events.send(event).await.is_err() {
            debug!("Event channel closed, dropping event");
        }
    }
}
