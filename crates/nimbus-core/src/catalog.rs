// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Application catalog cache.
//!
//! The application store is an external collaborator; the orchestrator
//! only needs `(name, version) -> descriptor` lookups. Lookups are cached
//! in an explicit cache object owned by the orchestrator, with
//! `invalidate()` called when the catalog reports a deletion - there is no
//! process-wide singleton.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CoreError;
use crate::job::ApplicationRef;

/// Resolved application metadata needed to run a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationDescriptor {
    /// Name and version.
    pub reference: ApplicationRef,
    /// Container image (Kubernetes) or module/tool name (SLURM).
    pub tool: String,
    /// Globs selecting output files to ship back.
    pub output_globs: Vec<String>,
}

/// Upstream source of application descriptors.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch a descriptor, or None if the application is unknown.
    async fn fetch(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<ApplicationDescriptor>, CoreError>;
}

/// Fixed catalog for tests and the sandbox profile.
#[derive(Default)]
pub struct StaticCatalog {
    entries: HashMap<ApplicationRef, ApplicationDescriptor>,
}

impl StaticCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor.
    pub fn with(mut self, descriptor: ApplicationDescriptor) -> Self {
        self.entries
            .insert(descriptor.reference.clone(), descriptor);
        self
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn fetch(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<ApplicationDescriptor>, CoreError> {
        let key = ApplicationRef::new(name, version);
        Ok(self.entries.get(&key).cloned())
    }
}

/// Caching wrapper around a [`CatalogSource`].
pub struct ApplicationCache {
    source: Arc<dyn CatalogSource>,
    cache: Mutex<HashMap<ApplicationRef, ApplicationDescriptor>>,
}

impl ApplicationCache {
    /// Create a cache over `source`.
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve an application, consulting the cache first.
    pub async fn lookup(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<ApplicationDescriptor>, CoreError> {
        let key = ApplicationRef::new(name, version);
        {
            let cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&key) {
                return Ok(Some(hit.clone()));
            }
        }

        let fetched = self.source.fetch(name, version).await?;
        if let Some(descriptor) = &fetched {
            let mut cache = self.cache.lock().await;
            cache.insert(key, descriptor.clone());
        }
        Ok(fetched)
    }

    /// Drop the cached entry for one application version.
    pub async fn invalidate(&self, name: &str, version: &str) {
        let key = ApplicationRef::new(name, version);
        let mut cache = self.cache.lock().await;
        if cache.remove(&key).is_some() {
            debug!(application = %key, "Invalidated catalog cache entry");
        }
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        inner: StaticCatalog,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl CatalogSource for CountingSource {
        async fn fetch(
            &self,
            name: &str,
            version: &str,
        ) -> Result<Option<ApplicationDescriptor>, CoreError> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            self.inner.fetch(name, version).await
        }
    }

    fn descriptor() -> ApplicationDescriptor {
        ApplicationDescriptor {
            reference: ApplicationRef::new("blast", "2.12.0"),
            tool: "ncbi/blast:2.12.0".to_string(),
            output_globs: vec!["*.out".to_string()],
        }
    }

    #[tokio::test]
    async fn test_lookup_caches() {
        let source = Arc::new(CountingSource {
            inner: StaticCatalog::new().with(descriptor()),
            fetches: AtomicUsize::new(0),
        });
        let cache = ApplicationCache::new(source.clone());

        assert!(cache.lookup("blast", "2.12.0").await.unwrap().is_some());
        assert!(cache.lookup("blast", "2.12.0").await.unwrap().is_some());
        assert_eq!(source.fetches.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let source = Arc::new(CountingSource {
            inner: StaticCatalog::new().with(descriptor()),
            fetches: AtomicUsize::new(0),
        });
        let cache = ApplicationCache::new(source.clone());

        cache.lookup("blast", "2.12.0").await.unwrap();
        cache.invalidate("blast", "2.12.0").await;
        assert!(cache.is_empty().await);
        cache.lookup("blast", "2.12.0").await.unwrap();
        assert_eq!(source.fetches.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_unknown_application_is_not_cached() {
        let source = Arc::new(CountingSource {
            inner: StaticCatalog::new(),
            fetches: AtomicUsize::new(0),
        });
        let cache = ApplicationCache::new(source.clone());
        assert!(cache.lookup("nope", "1.0").await.unwrap().is_none());
        assert!(cache.is_empty().await);
    }
}
