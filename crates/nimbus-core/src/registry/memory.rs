// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! In-memory registry backend.
//!
//! Used by tests and the sandbox deployment profile. Same semantics as the
//! PostgreSQL backend, including provider-id corruption detection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{JobRegistry, Transition, advance_in_place};
use crate::error::CoreError;
use crate::job::{ApplicationRef, Job, JobState, ProviderKind};

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    /// (provider, provider_job_id) -> job id
    provider_index: HashMap<(ProviderKind, String), String>,
}

/// In-memory job registry.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRegistry for MemoryRegistry {
    async fn create_job(&self, job: &Job) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(CoreError::ValidationError {
                field: "job_id".to_string(),
                message: format!("job '{}' already exists", job.id),
            });
        }
        if let Some(native) = &job.provider_job_id {
            inner
                .provider_index
                .insert((job.provider, native.clone()), job.id.clone());
        }
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(job_id).cloned())
    }

    async fn find_by_provider_id(
        &self,
        provider: ProviderKind,
        provider_job_id: &str,
    ) -> Result<Option<Job>, CoreError> {
        let inner = self.inner.lock().await;
        let job_id = inner
            .provider_index
            .get(&(provider, provider_job_id.to_string()));
        Ok(job_id.and_then(|id| inner.jobs.get(id)).cloned())
    }

    async fn assign_provider_job_id(
        &self,
        job_id: &str,
        provider: ProviderKind,
        provider_job_id: &str,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;

        let key = (provider, provider_job_id.to_string());
        if let Some(existing) = inner.provider_index.get(&key) {
            if existing != job_id {
                return Err(CoreError::RegistryCorruption {
                    provider,
                    provider_job_id: provider_job_id.to_string(),
                    details: format!("already mapped to job '{}'", existing),
                });
            }
        }

        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: job_id.to_string(),
            })?;

        match &job.provider_job_id {
            None => {
                job.provider_job_id = Some(provider_job_id.to_string());
                inner.provider_index.insert(key, job_id.to_string());
                Ok(())
            }
            Some(existing) if existing == provider_job_id => Ok(()),
            Some(existing) => Err(CoreError::RegistryCorruption {
                provider,
                provider_job_id: provider_job_id.to_string(),
                details: format!("job '{}' already assigned '{}'", job_id, existing),
            }),
        }
    }

    async fn advance_state(
        &self,
        job_id: &str,
        target: JobState,
        observed_at: DateTime<Utc>,
    ) -> Result<Transition, CoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        Ok(advance_in_place(job, target, observed_at))
    }

    async fn list_active(&self) -> Result<Vec<Job>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| !j.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn delete_for_application(
        &self,
        application: &ApplicationRef,
    ) -> Result<u64, CoreError> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| &j.application == application)
            .map(|j| j.id.clone())
            .collect();
        for id in &doomed {
            if let Some(job) = inner.jobs.remove(id) {
                if let Some(native) = job.provider_job_id {
                    inner.provider_index.remove(&(job.provider, native));
                }
            }
        }
        Ok(doomed.len() as u64)
    }
}
