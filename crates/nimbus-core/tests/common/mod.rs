// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Shared harness for integration tests: a full in-memory stack with the
//! sandbox provider, accounting ingestion, and the orchestrator event loop
//! running as a real task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use nimbus_core::accounting::{AccountingIngestion, IngestionConfig, MemoryLedger};
use nimbus_core::catalog::{ApplicationCache, ApplicationDescriptor, StaticCatalog};
use nimbus_core::job::{ApplicationRef, JobState, Reservation};
use nimbus_core::orchestrator::{JobSubmission, Orchestrator, QuotaPolicy};
use nimbus_core::provider::sandbox::SandboxProvider;
use nimbus_core::registry::JobRegistry;
use nimbus_core::registry::memory::MemoryRegistry;

pub struct TestStack {
    pub orchestrator: Arc<Orchestrator>,
    pub sandbox: Arc<SandboxProvider>,
    pub registry: Arc<MemoryRegistry>,
    pub ledger: Arc<MemoryLedger>,
    pub event_loop: JoinHandle<()>,
    pub ingestion_handles: Vec<JoinHandle<()>>,
    pub ingestion_shutdown: Arc<Notify>,
    pub orchestrator_shutdown: Arc<Notify>,
}

impl TestStack {
    /// Bring up the whole in-memory stack with fast accounting flushes.
    pub fn start() -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (accounting_tx, accounting_rx) = mpsc::channel(64);

        let sandbox = Arc::new(SandboxProvider::new(event_tx));
        let registry = Arc::new(MemoryRegistry::new());
        let ledger = Arc::new(MemoryLedger::new());

        let catalog = ApplicationCache::new(Arc::new(StaticCatalog::new().with(
            ApplicationDescriptor {
                reference: ApplicationRef::new("blast", "2.16.0"),
                tool: "ncbi/blast:2.16.0".to_string(),
                output_globs: vec!["*.out".to_string()],
            },
        )));

        let ingestion = AccountingIngestion::new(
            ledger.clone(),
            IngestionConfig {
                consumers: 2,
                max_batch: 100,
                max_delay: Duration::from_millis(25),
                flush_attempts: 3,
            },
        );
        let ingestion_shutdown = ingestion.shutdown_handle();
        let ingestion_handles = ingestion.spawn(accounting_rx);

        let mut orchestrator = Orchestrator::new(
            registry.clone(),
            ledger.clone(),
            catalog,
            accounting_tx,
            QuotaPolicy::default(),
        );
        orchestrator.register_provider(sandbox.clone());
        let orchestrator_shutdown = orchestrator.shutdown_handle();

        let orchestrator = Arc::new(orchestrator);
        let event_loop = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator.run(event_rx).await;
            })
        };

        Self {
            orchestrator,
            sandbox,
            registry,
            ledger,
            event_loop,
            ingestion_handles,
            ingestion_shutdown,
            orchestrator_shutdown,
        }
    }

    /// A valid submission against the sandbox's advertised reservations.
    pub fn submission() -> JobSubmission {
        JobSubmission {
            owner: "alice".to_string(),
            project: Some("genomics".to_string()),
            application: ApplicationRef::new("blast", "2.16.0"),
            reservation: Reservation {
                name: "u1-standard-1".to_string(),
                cpu: 1,
                memory_gb: 4,
                gpu: None,
            },
            nodes: 1,
            max_time: Duration::from_secs(3600),
            provider: None,
            output_folder: "/work/results".to_string(),
            input_files: vec![],
        }
    }

    /// Wait until a job reaches `target`, panicking after a second.
    pub async fn await_state(&self, job_id: &str, target: JobState) {
        for _ in 0..100 {
            let job = self.registry.get_job(job_id).await.unwrap().unwrap();
            if job.state == target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let job = self.registry.get_job(job_id).await.unwrap().unwrap();
        panic!("job {} stuck in {}, wanted {}", job_id, job.state, target);
    }

    /// Stop the event loop and flush pending accounting records.
    pub async fn shutdown(self) {
        self.orchestrator_shutdown.notify_one();
        self.event_loop.await.unwrap();

        // Dropping the orchestrator closes the accounting channel, so every
        // consumer drains and exits even if it was not parked on the
        // shutdown notification.
        drop(self.orchestrator);
        self.ingestion_shutdown.notify_one();
        for handle in self.ingestion_handles {
            handle.await.unwrap();
        }
    }
}
