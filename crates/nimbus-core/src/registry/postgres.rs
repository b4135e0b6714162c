// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! PostgreSQL registry backend.
//!
//! State transitions use guarded UPDATEs (`WHERE state = <observed>`), so
//! two orchestrator tasks racing on the same job cannot produce a lost
//! update: the loser's UPDATE matches zero rows and is reported as a
//! duplicate or rejection after a re-read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use std::time::Duration;

use super::{JobRegistry, Transition, advance_in_place};
use crate::error::CoreError;
use crate::job::{ApplicationRef, InputFile, Job, JobState, ProviderKind, Reservation};

/// PostgreSQL-backed job registry.
#[derive(Clone)]
pub struct PostgresRegistry {
    pool: PgPool,
}

impl PostgresRegistry {
    /// Create a registry over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn job_from_row(row: &PgRow) -> Result<Job, CoreError> {
        let provider: String = row.try_get("provider")?;
        let provider = match provider.as_str() {
            "kubernetes" => ProviderKind::Kubernetes,
            "slurm" => ProviderKind::Slurm,
            _ => ProviderKind::Sandbox,
        };

        let state: String = row.try_get("state")?;
        let state = JobState::parse(&state).ok_or_else(|| CoreError::DatabaseError {
            operation: "decode".to_string(),
            details: format!("unknown job state '{}'", state),
        })?;

        let input_files: String = row.try_get("input_files")?;
        let input_files: Vec<InputFile> =
            serde_json::from_str(&input_files).map_err(|e| CoreError::DatabaseError {
                operation: "decode".to_string(),
                details: format!("input_files: {}", e),
            })?;

        let max_time_secs: i64 = row.try_get("max_time_secs")?;
        let gpu: Option<i32> = row.try_get("gpu")?;

        Ok(Job {
            id: row.try_get("id")?,
            owner: row.try_get("owner")?,
            project: row.try_get("project")?,
            application: ApplicationRef {
                name: row.try_get("app_name")?,
                version: row.try_get("app_version")?,
            },
            reservation: Reservation {
                name: row.try_get("reservation_name")?,
                cpu: row.try_get::<i32, _>("cpu")? as u32,
                memory_gb: row.try_get::<i32, _>("memory_gb")? as u32,
                gpu: gpu.map(|g| g as u32),
            },
            nodes: row.try_get::<i32, _>("nodes")? as u32,
            max_time: Duration::from_secs(max_time_secs.max(0) as u64),
            provider,
            state,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            provider_job_id: row.try_get("provider_job_id")?,
            output_folder: row.try_get("output_folder")?,
            input_files,
        })
    }
}

const SELECT_JOB: &str = r#"
    SELECT id, owner, project, app_name, app_version,
           reservation_name, cpu, memory_gb, gpu, nodes, max_time_secs,
           provider, state, created_at, started_at, completed_at,
           provider_job_id, output_folder, input_files
    FROM jobs
"#;

#[async_trait]
impl JobRegistry for PostgresRegistry {
    async fn create_job(&self, job: &Job) -> Result<(), CoreError> {
        let input_files =
            serde_json::to_string(&job.input_files).map_err(|e| CoreError::DatabaseError {
                operation: "encode".to_string(),
                details: e.to_string(),
            })?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, owner, project, app_name, app_version,
                reservation_name, cpu, memory_gb, gpu, nodes, max_time_secs,
                provider, state, created_at, provider_job_id, output_folder, input_files
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(&job.id)
        .bind(&job.owner)
        .bind(&job.project)
        .bind(&job.application.name)
        .bind(&job.application.version)
        .bind(&job.reservation.name)
        .bind(job.reservation.cpu as i32)
        .bind(job.reservation.memory_gb as i32)
        .bind(job.reservation.gpu.map(|g| g as i32))
        .bind(job.nodes as i32)
        .bind(job.max_time.as_secs() as i64)
        .bind(job.provider.to_string())
        .bind(job.state.to_string())
        .bind(job.created_at)
        .bind(&job.provider_job_id)
        .bind(&job.output_folder)
        .bind(&input_files)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, CoreError> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_JOB))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn find_by_provider_id(
        &self,
        provider: ProviderKind,
        provider_job_id: &str,
    ) -> Result<Option<Job>, CoreError> {
        let row = sqlx::query(&format!(
            "{} WHERE provider = $1 AND provider_job_id = $2",
            SELECT_JOB
        ))
        .bind(provider.to_string())
        .bind(provider_job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn assign_provider_job_id(
        &self,
        job_id: &str,
        provider: ProviderKind,
        provider_job_id: &str,
    ) -> Result<(), CoreError> {
        // The partial unique index on (provider, provider_job_id) catches
        // cross-job duplicates; the WHERE guard catches re-assignment.
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET provider_job_id = $3
            WHERE id = $1
              AND provider = $2
              AND (provider_job_id IS NULL OR provider_job_id = $3)
            "#,
        )
        .bind(job_id)
        .bind(provider.to_string())
        .bind(provider_job_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(()),
            Ok(_) => {
                let existing = self.get_job(job_id).await?;
                match existing {
                    None => Err(CoreError::JobNotFound {
                        job_id: job_id.to_string(),
                    }),
                    Some(job) => Err(CoreError::RegistryCorruption {
                        provider,
                        provider_job_id: provider_job_id.to_string(),
                        details: format!(
                            "job '{}' already assigned '{}'",
                            job_id,
                            job.provider_job_id.unwrap_or_default()
                        ),
                    }),
                }
            }
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                Err(CoreError::RegistryCorruption {
                    provider,
                    provider_job_id: provider_job_id.to_string(),
                    details: "already mapped to another job".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn advance_state(
        &self,
        job_id: &str,
        target: JobState,
        observed_at: DateTime<Utc>,
    ) -> Result<Transition, CoreError> {
        let Some(mut job) = self.get_job(job_id).await? else {
            return Err(CoreError::JobNotFound {
                job_id: job_id.to_string(),
            });
        };

        let observed_state = job.state;
        let outcome = advance_in_place(&mut job, target, observed_at);
        let Transition::Applied { .. } = &outcome else {
            return Ok(outcome);
        };

        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2,
                started_at = COALESCE(started_at, $3),
                completed_at = COALESCE(completed_at, $4)
            WHERE id = $1 AND state = $5
            "#,
        )
        .bind(job_id)
        .bind(target.to_string())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(observed_state.to_string())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 1 {
            return Ok(Transition::Applied { job });
        }

        // A concurrent writer advanced the job first. Classify against the
        // state it actually holds now.
        let current = self
            .get_job(job_id)
            .await?
            .map(|j| j.state)
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        if current == target {
            Ok(Transition::Duplicate)
        } else {
            Ok(Transition::Rejected { current })
        }
    }

    async fn list_active(&self) -> Result<Vec<Job>, CoreError> {
        let rows = sqlx::query(&format!(
            "{} WHERE state IN ('IN_QUEUE', 'PREPARING', 'RUNNING') ORDER BY created_at",
            SELECT_JOB
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn delete_for_application(
        &self,
        application: &ApplicationRef,
    ) -> Result<u64, CoreError> {
        let done = sqlx::query("DELETE FROM jobs WHERE app_name = $1 AND app_version = $2")
            .bind(&application.name)
            .bind(&application.version)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}
