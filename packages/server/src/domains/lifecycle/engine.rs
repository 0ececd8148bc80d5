//! Lifecycle engine: operation chains, scheduling, queue integration.
//!
//! A lifecycle job processes exactly one dataset, running its requested
//! operations in declared order; each operation receives the manifest the
//! previous one produced. An operation failure aborts the rest of the chain
//! and fails the job; the job is never retried automatically.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::compaction::run_compaction;
use super::metrics::LifecycleMetrics;
use super::migration::run_migration;
use super::model::{LifecycleJobRun, LifecycleOperation, LifecycleRunStatus, TriggerSource};
use super::retention::run_retention;
use crate::common::error::{CoreError, CoreResult};
use crate::domains::audit;
use crate::domains::columnar::ColumnarDriver;
use crate::domains::datasets::{
    Dataset, DatasetManifest, DatasetPartition, ManifestEngine, RetentionPolicy,
};
use crate::kernel::metrics::Metrics;
use crate::kernel::queue::{names, EnqueueOptions, JobEnvelope, Queue, QueueHandler};
use crate::kernel::storage::StorageDriver;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub interval: Duration,
    pub jitter: Duration,
    pub concurrency: usize,
    /// Compaction chunk byte budget.
    pub compaction_chunk_bytes: i64,
    /// Relational rows older than this move to the columnar backend.
    pub migration_age_hours: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            jitter: Duration::from_secs(30),
            concurrency: 2,
            compaction_chunk_bytes: 64 * 1024 * 1024,
            migration_age_hours: 720,
        }
    }
}

/// Queue payload for a lifecycle run.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleDispatch {
    pub lifecycle_run_id: Uuid,
}

pub struct LifecycleEngine {
    pool: PgPool,
    manifests: Arc<ManifestEngine>,
    storage: Arc<dyn StorageDriver>,
    columnar: Arc<dyn ColumnarDriver>,
    metrics: Arc<LifecycleMetrics>,
    kernel_metrics: Metrics,
    config: LifecycleConfig,
}

impl LifecycleEngine {
    pub fn new(
        pool: PgPool,
        manifests: Arc<ManifestEngine>,
        storage: Arc<dyn StorageDriver>,
        columnar: Arc<dyn ColumnarDriver>,
        kernel_metrics: Metrics,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            manifests,
            storage,
            columnar,
            metrics: Arc::new(LifecycleMetrics::new()),
            kernel_metrics,
            config,
        })
    }

    pub fn metrics(&self) -> Arc<LifecycleMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Create a run row and enqueue its dispatch. The dedupe key keeps one
    /// live maintenance job per dataset.
    pub async fn schedule_dataset(
        &self,
        queue: &Arc<dyn Queue>,
        dataset_id: Uuid,
        operations: &[LifecycleOperation],
        trigger: TriggerSource,
    ) -> CoreResult<LifecycleJobRun> {
        let run = LifecycleJobRun::create(
            dataset_id,
            operations,
            trigger,
            Some(Utc::now()),
            &self.pool,
        )
        .await?;
        queue
            .enqueue(
                names::LIFECYCLE,
                serde_json::to_value(LifecycleDispatch {
                    lifecycle_run_id: run.id,
                })?,
                EnqueueOptions {
                    job_id: Some(format!("lifecycle:{dataset_id}")),
                    remove_on_complete: true,
                    ..Default::default()
                },
            )
            .await?;
        Ok(run)
    }

    /// Execute a lifecycle run to completion.
    pub async fn execute(&self, lifecycle_run_id: Uuid) -> CoreResult<()> {
        let Some(run) = LifecycleJobRun::find(lifecycle_run_id, &self.pool).await? else {
            warn!(run_id = %lifecycle_run_id, "lifecycle dispatch for unknown run");
            return Ok(());
        };
        let Some(run) = LifecycleJobRun::mark_running(run.id, &self.pool).await? else {
            return Ok(());
        };
        self.metrics.job_started();

        let outcome = self.run_operations(&run).await;
        match outcome {
            Ok(summary) => {
                LifecycleJobRun::complete(
                    run.id,
                    LifecycleRunStatus::Succeeded,
                    None,
                    summary,
                    &self.pool,
                )
                .await?;
                self.metrics.job_completed();
            }
            Err(err) => {
                error!(run_id = %run.id, error = %err, "lifecycle job failed");
                LifecycleJobRun::complete(
                    run.id,
                    LifecycleRunStatus::Failed,
                    Some(&err.to_string()),
                    serde_json::json!({}),
                    &self.pool,
                )
                .await?;
                self.metrics.job_failed();
            }
        }
        Ok(())
    }

    /// Run the declared operations in order across every published shard of
    /// the dataset. The first failure aborts the remainder.
    async fn run_operations(&self, run: &LifecycleJobRun) -> CoreResult<serde_json::Value> {
        let operations = run.parsed_operations()?;
        let dataset_id = run
            .dataset_id
            .ok_or_else(|| CoreError::validation("lifecycle run has no dataset"))?;
        let dataset = Dataset::find_by_id(dataset_id, &self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("dataset not found"))?;

        let mut summary = serde_json::Map::new();
        for operation in operations {
            let result = self.run_one(&dataset, operation).await?;
            summary.insert(operation.as_str().to_string(), result);
        }
        Ok(serde_json::Value::Object(summary))
    }

    async fn run_one(
        &self,
        dataset: &Dataset,
        operation: LifecycleOperation,
    ) -> CoreResult<serde_json::Value> {
        match operation {
            LifecycleOperation::Compaction => {
                let mut totals = (0usize, 0usize, 0i64);
                for (manifest, partitions) in self.published_lanes(dataset.id).await? {
                    let outcome = run_compaction(
                        dataset,
                        &manifest,
                        &partitions,
                        &self.manifests,
                        &self.storage,
                        &self.metrics,
                        self.config.compaction_chunk_bytes,
                    )
                    .await?;
                    totals.0 += outcome.chunks_rewritten;
                    totals.1 += outcome.partitions_removed;
                    totals.2 += outcome.bytes_rewritten;
                    if let Some(manifest) = &outcome.manifest {
                        audit::record_lifecycle_event(
                            &self.pool,
                            &self.kernel_metrics,
                            dataset.id,
                            Some(manifest.id),
                            "compaction.rewrite",
                            serde_json::json!({
                                "chunks": outcome.chunks_rewritten,
                                "partitions": outcome.partitions_removed,
                                "bytes": outcome.bytes_rewritten,
                            }),
                        )
                        .await;
                    }
                }
                Ok(serde_json::json!({
                    "chunks": totals.0,
                    "partitions": totals.1,
                    "bytes": totals.2,
                }))
            }
            LifecycleOperation::Retention => {
                let Some(policy) = RetentionPolicy::find(dataset.id, &self.pool).await? else {
                    return Ok(serde_json::json!({"skipped": "no retention policy"}));
                };
                let mut dropped = 0usize;
                let mut bytes = 0i64;
                for (manifest, partitions) in self.published_lanes(dataset.id).await? {
                    let outcome = run_retention(
                        dataset,
                        &manifest,
                        &partitions,
                        &policy,
                        &self.manifests,
                        &self.storage,
                        &self.metrics,
                        &self.kernel_metrics,
                    )
                    .await?;
                    dropped += outcome.partitions_dropped;
                    bytes += outcome.bytes_dropped;
                }
                Ok(serde_json::json!({"partitions": dropped, "bytes": bytes}))
            }
            LifecycleOperation::PostgresMigration => {
                let outcome = run_migration(
                    dataset.id,
                    self.config.migration_age_hours,
                    0,
                    &self.pool,
                    &self.columnar,
                    &self.metrics,
                )
                .await?;
                Ok(serde_json::json!({
                    "tables": outcome.tables_processed,
                    "rows": outcome.rows_migrated,
                }))
            }
        }
    }

    async fn published_lanes(
        &self,
        dataset_id: Uuid,
    ) -> CoreResult<Vec<(DatasetManifest, Vec<DatasetPartition>)>> {
        let manifests = DatasetManifest::published_for_dataset(dataset_id, &self.pool).await?;
        let mut lanes = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            let partitions = DatasetPartition::for_manifest(manifest.id, &self.pool).await?;
            lanes.push((manifest, partitions));
        }
        Ok(lanes)
    }

    /// Interval scheduler: every tick (plus jitter) enqueue a maintenance
    /// job per active dataset.
    pub fn spawn_scheduler(self: &Arc<Self>, queue: Arc<dyn Queue>, shutdown: CancellationToken) {
        let engine = self.clone();
        tokio::spawn(async move {
            info!(
                interval_s = engine.config.interval.as_secs(),
                jitter_s = engine.config.jitter.as_secs(),
                "lifecycle scheduler starting"
            );
            loop {
                let jitter_ms = if engine.config.jitter.is_zero() {
                    0
                } else {
                    rand::thread_rng().gen_range(0..engine.config.jitter.as_millis() as u64)
                };
                let sleep = engine.config.interval + Duration::from_millis(jitter_ms);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(sleep) => {}
                }

                let datasets = match Dataset::active_ids(&engine.pool).await {
                    Ok(ids) => ids,
                    Err(e) => {
                        warn!(error = %e, "lifecycle scheduler listing failed");
                        continue;
                    }
                };
                for dataset_id in datasets {
                    let result = engine
                        .schedule_dataset(
                            &queue,
                            dataset_id,
                            &[
                                LifecycleOperation::Compaction,
                                LifecycleOperation::Retention,
                                LifecycleOperation::PostgresMigration,
                            ],
                            TriggerSource::Schedule,
                        )
                        .await;
                    if let Err(e) = result {
                        warn!(dataset_id = %dataset_id, error = %e, "lifecycle schedule failed");
                    }
                }
            }
            info!("lifecycle scheduler stopped");
        });
    }
}

pub struct LifecycleJobHandler {
    engine: Arc<LifecycleEngine>,
}

impl LifecycleJobHandler {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl QueueHandler for LifecycleJobHandler {
    async fn handle(&self, job: JobEnvelope) -> CoreResult<()> {
        let dispatch: LifecycleDispatch = serde_json::from_value(job.payload)?;
        self.engine.execute(dispatch.lifecycle_run_id).await
    }
}
