//! Postgres-backed durable queue.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so any number of workers can pull from
//! the same queue without coordination. Running jobs hold a lease; expired
//! leases are reclaimed on the next claim pass, which is what makes delivery
//! at-least-once. Repeating jobs re-arm themselves on completion.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::{
    worker::{WorkerPool, WorkerPoolConfig},
    EnqueueOptions, JobEnvelope, Queue, QueueHandler, QueueHealth,
};
use crate::common::error::{CoreError, CoreResult};
use crate::common::ids::db_id;

/// Raw queue row, claimed or otherwise.
#[derive(Debug, Clone, FromRow)]
pub struct QueueJobRow {
    pub id: Uuid,
    pub queue_name: String,
    pub dedupe_key: Option<String>,
    pub payload: serde_json::Value,
    pub attempt: i32,
    pub max_attempts: i32,
    pub repeat_every_ms: Option<i64>,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl QueueJobRow {
    pub fn envelope(&self) -> JobEnvelope {
        JobEnvelope {
            job_id: self.id,
            queue_name: self.queue_name.clone(),
            payload: self.payload.clone(),
            attempt: self.attempt,
        }
    }
}

const DEFAULT_LEASE_MS: i64 = 60_000;
/// Retry backoff: 2^attempt seconds, capped at one hour.
const MAX_BACKOFF_SECS: i64 = 3600;

/// Shared broker state: the pool plus health bookkeeping. Worker pools hold
/// an `Arc` to this so claims and completions survive queue handle clones.
pub(crate) struct QueueCore {
    pool: PgPool,
    lease_ms: i64,
    last_error: Mutex<Option<String>>,
}

impl QueueCore {
    fn record_error(&self, err: &CoreError) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
    }

    /// Claim up to `limit` ready jobs, recovering expired leases.
    pub(crate) async fn claim(
        &self,
        queue_name: &str,
        worker_id: &str,
        limit: i64,
    ) -> CoreResult<Vec<QueueJobRow>> {
        let rows = sqlx::query_as::<_, QueueJobRow>(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM queue_jobs
                WHERE queue_name = $1
                  AND (
                    (status = 'pending' AND run_at <= NOW())
                    OR (status = 'running' AND lease_expires_at < NOW())
                  )
                ORDER BY priority, run_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs
            SET status = 'running',
                lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                worker_id = $4,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING id, queue_name, dedupe_key, payload, attempt, max_attempts,
                      repeat_every_ms, remove_on_complete, remove_on_fail
            "#,
        )
        .bind(queue_name)
        .bind(limit)
        .bind(self.lease_ms.to_string())
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::from);

        match rows {
            Ok(rows) => Ok(rows),
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Extend the lease for a running job (heartbeat).
    pub(crate) async fn heartbeat(&self, job_id: Uuid) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET lease_expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(self.lease_ms.to_string())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a delivery as done. Repeating jobs re-arm instead of completing;
    /// `remove_on_complete` rows are deleted outright.
    pub(crate) async fn mark_succeeded(&self, job: &QueueJobRow) -> CoreResult<()> {
        if let Some(every_ms) = job.repeat_every_ms {
            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET status = 'pending',
                    run_at = NOW() + ($1 || ' milliseconds')::INTERVAL,
                    attempt = 1,
                    error_message = NULL,
                    lease_expires_at = NULL,
                    worker_id = NULL,
                    updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(every_ms.to_string())
            .bind(job.id)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        if job.remove_on_complete {
            sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
                .bind(job.id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        sqlx::query("UPDATE queue_jobs SET status = 'succeeded', updated_at = NOW() WHERE id = $1")
            .bind(job.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed delivery. Retryable failures requeue with exponential
    /// backoff until attempts are exhausted; everything else dead-letters.
    pub(crate) async fn mark_failed(&self, job: &QueueJobRow, error: &CoreError) -> CoreResult<()> {
        let retry = error.is_retryable() && job.attempt < job.max_attempts;
        if retry {
            let delay_secs = 2i64
                .saturating_pow(job.attempt.max(0) as u32)
                .min(MAX_BACKOFF_SECS);
            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET status = 'pending',
                    attempt = attempt + 1,
                    run_at = NOW() + ($1 || ' seconds')::INTERVAL,
                    error_message = $2,
                    lease_expires_at = NULL,
                    worker_id = NULL,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(delay_secs.to_string())
            .bind(error.to_string())
            .bind(job.id)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        if job.remove_on_fail {
            sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
                .bind(job.id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'dead_letter', error_message = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(error.to_string())
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct PostgresQueue {
    core: Arc<QueueCore>,
    shutdown: CancellationToken,
}

impl PostgresQueue {
    pub fn new(pool: PgPool, shutdown: CancellationToken) -> Self {
        Self {
            core: Arc::new(QueueCore {
                pool,
                lease_ms: DEFAULT_LEASE_MS,
                last_error: Mutex::new(None),
            }),
            shutdown,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.core.pool
    }

    /// Next scheduled run time across a queue, for idle-sleep tuning.
    pub async fn next_run_time(&self, queue_name: &str) -> CoreResult<Option<DateTime<Utc>>> {
        let next = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT run_at FROM queue_jobs
            WHERE queue_name = $1 AND status = 'pending'
            ORDER BY run_at ASC
            LIMIT 1
            "#,
        )
        .bind(queue_name)
        .fetch_optional(&self.core.pool)
        .await?;
        Ok(next)
    }
}

#[async_trait]
impl Queue for PostgresQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> CoreResult<Uuid> {
        // Idempotency pre-check; the partial unique index backs this up under
        // concurrent inserts.
        if let Some(key) = &opts.job_id {
            let existing = sqlx::query_scalar::<_, Uuid>(
                r#"
                SELECT id FROM queue_jobs
                WHERE queue_name = $1 AND dedupe_key = $2
                  AND status IN ('pending', 'running')
                LIMIT 1
                "#,
            )
            .bind(queue_name)
            .bind(key)
            .fetch_optional(&self.core.pool)
            .await?;
            if let Some(id) = existing {
                return Ok(id);
            }
        }

        let id = db_id();
        let run_at = Utc::now() + ChronoDuration::milliseconds(opts.delay_ms.unwrap_or(0));
        let result = sqlx::query(
            r#"
            INSERT INTO queue_jobs (
                id, queue_name, dedupe_key, payload, status, priority, attempt,
                max_attempts, run_at, repeat_every_ms, remove_on_complete,
                remove_on_fail
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, 1, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(queue_name)
        .bind(&opts.job_id)
        .bind(&payload)
        .bind(opts.priority.unwrap_or(2))
        .bind(opts.max_attempts.unwrap_or(3))
        .bind(run_at)
        .bind(opts.repeat_every_ms)
        .bind(opts.remove_on_complete)
        .bind(opts.remove_on_fail)
        .execute(&self.core.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            // Lost the race on the dedupe index: surface the winner.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let key = opts.job_id.as_deref().unwrap_or_default();
                let winner = sqlx::query_scalar::<_, Uuid>(
                    r#"
                    SELECT id FROM queue_jobs
                    WHERE queue_name = $1 AND dedupe_key = $2
                      AND status IN ('pending', 'running')
                    LIMIT 1
                    "#,
                )
                .bind(queue_name)
                .bind(key)
                .fetch_one(&self.core.pool)
                .await?;
                Ok(winner)
            }
            Err(e) => {
                let err = CoreError::from(e);
                self.core.record_error(&err);
                Err(err)
            }
        }
    }

    async fn register_worker(
        &self,
        queue_name: &str,
        concurrency: usize,
        handler: Arc<dyn QueueHandler>,
    ) -> CoreResult<()> {
        info!(queue = queue_name, concurrency, "registering worker pool");
        let pool = WorkerPool::new(
            self.core.clone(),
            queue_name.to_string(),
            handler,
            WorkerPoolConfig {
                concurrency,
                ..WorkerPoolConfig::default()
            },
        );
        pool.spawn(self.shutdown.clone());
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'canceled', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .execute(&self.core.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    fn health(&self) -> QueueHealth {
        QueueHealth {
            ready: !self.shutdown.is_cancelled(),
            inline: false,
            last_error: self
                .core
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}
