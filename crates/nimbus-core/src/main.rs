// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Nimbus Core - Compute Job Orchestration
//!
//! This binary wires the orchestration core for standalone operation:
//! - Job registry (PostgreSQL when configured, in-memory otherwise)
//! - Accounting ingestion workers
//! - The sandbox provider adapter
//!
//! Backend binaries link nimbus-kubernetes or nimbus-slurm and register
//! their adapters in place of the sandbox.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tracing::{error, info};

use nimbus_core::accounting::{
    AccountingIngestion, IngestionConfig, MemoryLedger, PostgresLedger, UsageLedger,
};
use nimbus_core::catalog::{ApplicationCache, StaticCatalog};
use nimbus_core::config::Config;
use nimbus_core::migrations;
use nimbus_core::orchestrator::{Orchestrator, QuotaPolicy};
use nimbus_core::provider::sandbox::SandboxProvider;
use nimbus_core::registry::memory::MemoryRegistry;
use nimbus_core::registry::postgres::PostgresRegistry;
use nimbus_core::registry::JobRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nimbus_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Nimbus Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        accounting_consumers = config.accounting_consumers,
        accounting_batch_size = config.accounting_batch_size,
        "Configuration loaded"
    );

    // Select storage backends
    let (registry, ledger): (Arc<dyn JobRegistry>, Arc<dyn UsageLedger>) =
        match &config.database_url {
            Some(url) => {
                info!("Connecting to database...");
                let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;

                let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
                info!(result = row.0, "Database health check passed");

                info!("Running database migrations...");
                migrations::run_postgres(&pool).await?;
                info!("Migrations completed");

                (
                    Arc::new(PostgresRegistry::new(pool.clone())),
                    Arc::new(PostgresLedger::new(pool)),
                )
            }
            None => {
                info!("No database configured, using in-memory storage");
                (Arc::new(MemoryRegistry::new()), Arc::new(MemoryLedger::new()))
            }
        };

    let active = registry.list_active().await?;
    if !active.is_empty() {
        info!(count = active.len(), "Resuming with active jobs in the registry");
    }

    // Accounting ingestion workers
    let (accounting_tx, accounting_rx) = mpsc::channel(1024);
    let ingestion = AccountingIngestion::new(
        ledger.clone(),
        IngestionConfig {
            consumers: config.accounting_consumers,
            max_batch: config.accounting_batch_size,
            max_delay: config.accounting_max_delay,
            ..IngestionConfig::default()
        },
    );
    let ingestion_shutdown = ingestion.shutdown_handle();
    let ingestion_handles = ingestion.spawn(accounting_rx);

    // Backend event channel and the sandbox adapter
    let (event_tx, event_rx) = mpsc::channel(1024);
    let sandbox = Arc::new(SandboxProvider::new(event_tx));

    let mut orchestrator = Orchestrator::new(
        registry,
        ledger,
        ApplicationCache::new(Arc::new(StaticCatalog::new())),
        accounting_tx,
        QuotaPolicy {
            max_usage: config.quota_max_usage,
        },
    );
    orchestrator.register_provider(sandbox);
    let orchestrator_shutdown = orchestrator.shutdown_handle();

    info!("Nimbus Core initialized successfully");

    let event_loop = tokio::spawn(async move {
        orchestrator.run(event_rx).await;
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    // notify_one stores a permit, so the signal is not lost if a loop is
    // mid-event rather than parked when it arrives.
    orchestrator_shutdown.notify_one();
    event_loop.await?;

    // Flush pending accounting records before exit
    ingestion_shutdown.notify_one();
    for handle in ingestion_handles {
        handle.await?;
    }

    info!("Shutdown complete");
    Ok(())
}
