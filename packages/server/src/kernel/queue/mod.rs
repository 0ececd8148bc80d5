//! Durable work queue with inline fallback.
//!
//! Two execution modes, selected at startup: distributed (Postgres-backed
//! broker, required when multiple workers exist) and inline (operations run
//! synchronously on the calling thread, gated by configuration to prevent
//! production misuse). Both modes share one contract; ordering is per-job-id
//! FIFO with no cross-key guarantees.

mod inline;
mod postgres;
mod worker;

pub use inline::InlineQueue;
pub use postgres::PostgresQueue;
pub use worker::{WorkerPool, WorkerPoolConfig};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::error::CoreResult;

/// Options accepted by `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Caller-supplied idempotency key. A live (pending or running) job with
    /// the same key on the same queue absorbs the enqueue.
    pub job_id: Option<String>,
    /// Delay before the job becomes claimable.
    pub delay_ms: Option<i64>,
    /// Re-arm interval for repeating jobs.
    pub repeat_every_ms: Option<i64>,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
    pub max_attempts: Option<i32>,
    pub priority: Option<i16>,
}

/// What a worker sees for each delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: Uuid,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub attempt: i32,
}

/// Handler attached to a queue by `register_worker`.
///
/// Returning a retryable error requeues with backoff; a terminal error
/// dead-letters the job.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, job: JobEnvelope) -> CoreResult<()>;
}

/// Observable queue health, fed into the readiness probe.
#[derive(Debug, Clone, Serialize, Default)]
pub struct QueueHealth {
    pub ready: bool,
    pub inline: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// The queue contract shared by both modes.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue a payload; returns the job id. Idempotent when
    /// `opts.job_id` is supplied.
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> CoreResult<Uuid>;

    /// Attach a pool of `concurrency` workers to a named queue.
    async fn register_worker(
        &self,
        queue_name: &str,
        concurrency: usize,
        handler: Arc<dyn QueueHandler>,
    ) -> CoreResult<()>;

    /// Cancel a pending job. Running jobs are cancelled cooperatively by the
    /// owning runtime, not the queue.
    async fn cancel(&self, job_id: Uuid) -> CoreResult<bool>;

    fn health(&self) -> QueueHealth;
}

/// Well-known queue names.
pub mod names {
    /// Job-run dispatch.
    pub const JOB_RUNS: &str = "strata:job-runs";
    /// Queued ingestion requests.
    pub const INGEST: &str = "strata:ingest";
    /// Lifecycle maintenance jobs.
    pub const LIFECYCLE: &str = "strata:lifecycle";
    /// Repository-special jobs short-circuit here.
    pub const REPOSITORY: &str = "strata:repository";
}
