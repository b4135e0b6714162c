// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Accounting ingestion: batched, idempotent persistence of completed-job
//! usage.
//!
//! Terminal transitions enqueue [`AccountingRecord`]s on a channel. A set
//! of parallel consumers drains the channel in batches (up to
//! `max_batch` records or `max_delay`, whichever first) and performs one
//! ledger insert per batch. Delivery is at-least-once; the ledger is keyed
//! by job id, so duplicate completion signals never double-bill.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use crate::error::CoreError;
use crate::job::AccountingRecord;

/// Ledger of billed usage, idempotent by job id.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Insert a batch of records. Records whose job id is already present
    /// are skipped. Returns the number of newly inserted records.
    async fn record_batch(&self, records: &[AccountingRecord]) -> Result<u64, CoreError>;

    /// Total duration billed personally to `owner` (jobs submitted outside
    /// any project context).
    async fn usage_for_owner(&self, owner: &str) -> Result<Duration, CoreError>;

    /// Total duration billed to `project`. Project attribution takes
    /// precedence: jobs submitted under a project never count as personal
    /// usage.
    async fn usage_for_project(&self, project: &str) -> Result<Duration, CoreError>;
}

/// In-memory ledger for tests and the sandbox profile.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<String, AccountingRecord>>,
}

impl MemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Whether the ledger holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// The record for a job, if billed.
    pub async fn get(&self, job_id: &str) -> Option<AccountingRecord> {
        self.records.lock().await.get(job_id).cloned()
    }
}

#[async_trait]
impl UsageLedger for MemoryLedger {
    async fn record_batch(&self, records: &[AccountingRecord]) -> Result<u64, CoreError> {
        let mut held = self.records.lock().await;
        let mut inserted = 0u64;
        for record in records {
            if !held.contains_key(&record.job_id) {
                held.insert(record.job_id.clone(), record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn usage_for_owner(&self, owner: &str) -> Result<Duration, CoreError> {
        let held = self.records.lock().await;
        Ok(held
            .values()
            .filter(|r| r.owner == owner && r.project.is_none())
            .map(|r| r.duration)
            .sum())
    }

    async fn usage_for_project(&self, project: &str) -> Result<Duration, CoreError> {
        let held = self.records.lock().await;
        Ok(held
            .values()
            .filter(|r| r.project.as_deref() == Some(project))
            .map(|r| r.duration)
            .sum())
    }
}

/// PostgreSQL-backed ledger.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Create a ledger over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageLedger for PostgresLedger {
    async fn record_batch(&self, records: &[AccountingRecord]) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for record in records {
            let done = sqlx::query(
                r#"
                INSERT INTO accounting_records (
                    job_id, app_name, app_version, node_count, duration_ms,
                    owner, project, reservation_name, completed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (job_id) DO NOTHING
                "#,
            )
            .bind(&record.job_id)
            .bind(&record.application.name)
            .bind(&record.application.version)
            .bind(record.node_count as i32)
            .bind(record.duration.as_millis() as i64)
            .bind(&record.owner)
            .bind(&record.project)
            .bind(&record.reservation.name)
            .bind(record.completed_at)
            .execute(&mut *tx)
            .await?;
            inserted += done.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn usage_for_owner(&self, owner: &str) -> Result<Duration, CoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(duration_ms), 0) AS total
             FROM accounting_records WHERE owner = $1 AND project IS NULL",
        )
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        Ok(Duration::from_millis(total.max(0) as u64))
    }

    async fn usage_for_project(&self, project: &str) -> Result<Duration, CoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(duration_ms), 0) AS total
             FROM accounting_records WHERE project = $1",
        )
        .bind(project)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        Ok(Duration::from_millis(total.max(0) as u64))
    }
}

/// Accounting ingestion configuration.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Number of parallel batched consumers.
    pub consumers: usize,
    /// Flush when this many records are batched.
    pub max_batch: usize,
    /// Flush when the oldest batched record is this old.
    pub max_delay: Duration,
    /// Bounded attempts per batch before records are dropped.
    pub flush_attempts: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            consumers: 4,
            max_batch: 1000,
            max_delay: Duration::from_millis(500),
            flush_attempts: 3,
        }
    }
}

/// Batched accounting consumer pool.
pub struct AccountingIngestion {
    ledger: Arc<dyn UsageLedger>,
    config: IngestionConfig,
    shutdown: Arc<Notify>,
}

impl AccountingIngestion {
    /// Create an ingestion pool writing into `ledger`.
    pub fn new(ledger: Arc<dyn UsageLedger>, config: IngestionConfig) -> Self {
        Self {
            ledger,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    ///
    /// Signal it with `notify_one`; the first consumer to observe the permit
    /// hands it on, so one call stops the whole pool.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Spawn the consumer tasks draining `rx`.
    ///
    /// Returns the join handles; the tasks exit when the channel closes or
    /// shutdown is signalled (pending batches are flushed first).
    pub fn spawn(
        &self,
        rx: mpsc::Receiver<AccountingRecord>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        info!(
            consumers = self.config.consumers,
            max_batch = self.config.max_batch,
            max_delay_ms = self.config.max_delay.as_millis() as u64,
            "Accounting ingestion started"
        );

        (0..self.config.consumers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let ledger = self.ledger.clone();
                let config = self.config.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    consumer_loop(worker, rx, ledger, config, shutdown).await;
                })
            })
            .collect()
    }
}

async fn consumer_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<AccountingRecord>>>,
    ledger: Arc<dyn UsageLedger>,
    config: IngestionConfig,
    shutdown: Arc<Notify>,
) {
    loop {
        let mut batch: Vec<AccountingRecord> = Vec::new();

        // The receiver lock is held for the whole collection window, so
        // consumers take turns filling a batch. Flushing happens outside the
        // lock; that is where the pool overlaps work when the ledger is slow.
        {
            let mut rx = rx.lock().await;

            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    // A single notify_one permit stops one consumer; pass it
                    // along so the rest of the pool stops too.
                    shutdown.notify_one();
                    // Flush whatever is still queued, then stop.
                    while let Ok(record) = rx.try_recv() {
                        batch.push(record);
                    }
                    drop(rx);
                    if !batch.is_empty() {
                        flush(worker, &ledger, &config, &batch).await;
                    }
                    debug!(worker, "Accounting consumer stopped");
                    return;
                }

                received = rx.recv() => {
                    match received {
                        Some(record) => batch.push(record),
                        None => {
                            debug!(worker, "Accounting channel closed");
                            return;
                        }
                    }
                }
            }

            let deadline = Instant::now() + config.max_delay;
            while batch.len() < config.max_batch {
                match timeout_at(deadline, rx.recv()).await {
                    Ok(Some(record)) => batch.push(record),
                    Ok(None) => break,
                    Err(_) => break, // batch window elapsed
                }
            }
        }

        flush(worker, &ledger, &config, &batch).await;
    }
}

async fn flush(
    worker: usize,
    ledger: &Arc<dyn UsageLedger>,
    config: &IngestionConfig,
    batch: &[AccountingRecord],
) {
    // Always try at least once even with a zero attempt budget.
    let attempts = config.flush_attempts.max(1);
    for attempt in 1..=attempts {
        match ledger.record_batch(batch).await {
            Ok(inserted) => {
                debug!(
                    worker,
                    batch = batch.len(),
                    inserted,
                    "Accounting batch flushed"
                );
                return;
            }
            Err(e) if attempt < attempts => {
                warn!(worker, attempt, error = %e, "Accounting flush failed, retrying");
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            Err(e) => {
                error!(
                    worker,
                    batch = batch.len(),
                    error = %e,
                    "Accounting flush failed, dropping batch"
                );
            }
        }
    }
}
