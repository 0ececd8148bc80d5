//! Ingestion pipeline.
//!
//! Validate against the dataset's current schema version (auto-upgrading on
//! additive differences), write one partition file, and publish a manifest
//! version that appends the partition to the survivors of the previous
//! manifest. Idempotency keys guarantee at most one partition per
//! `(dataset, key)` across retries.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use tracing::info;
use uuid::Uuid;

use super::bloom::BloomFilter;
use super::stats::compute_column_stats;
use super::writer::{self, write_partition};
use crate::common::error::{CoreError, CoreResult};
use crate::common::ids::db_id;
use crate::domains::audit;
use crate::domains::datasets::{
    schema_incompatible, Dataset, DatasetPartition, ManifestEngine, NewPartition, PublishManifest,
    SchemaCompatibility, SchemaDef, SchemaVersion, StorageTarget,
};
use crate::kernel::metrics::Metrics;
use crate::kernel::queue::{JobEnvelope, QueueHandler};
use crate::kernel::storage::StorageDriver;

// ============================================================================
// Request / outcome
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionSpec {
    /// Ordered partition-key tuple.
    pub key: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Map<String, serde_json::Value>>,
    pub time_range: TimeRange,
}

impl PartitionSpec {
    /// Manifest shard for this partition; `attributes.shard` wins, else the
    /// default lane.
    pub fn shard(&self) -> String {
        self.attributes
            .as_ref()
            .and_then(|a| a.get("shard"))
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub schema: SchemaDef,
    pub partition: PartitionSpec,
    pub rows: Vec<serde_json::Value>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub storage_target_id: Option<Uuid>,
    #[serde(default)]
    pub table_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub dataset_id: Uuid,
    pub manifest_id: Option<Uuid>,
    pub manifest_version: Option<i32>,
    pub partition_id: Option<Uuid>,
    pub deduplicated: bool,
    pub mode: String,
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct IngestPipeline {
    pool: PgPool,
    engine: Arc<ManifestEngine>,
    storage: Arc<dyn StorageDriver>,
    default_target: StorageTarget,
    metrics: Metrics,
}

impl IngestPipeline {
    pub fn new(
        pool: PgPool,
        engine: Arc<ManifestEngine>,
        storage: Arc<dyn StorageDriver>,
        default_target: StorageTarget,
        metrics: Metrics,
    ) -> Self {
        Self {
            pool,
            engine,
            storage,
            default_target,
            metrics,
        }
    }

    /// Run the full pipeline on the caller's task.
    pub async fn ingest(&self, dataset_slug: &str, request: IngestRequest) -> CoreResult<IngestOutcome> {
        if request.rows.is_empty() {
            return Err(CoreError::validation("rows must not be empty"));
        }
        if request.partition.time_range.start > request.partition.time_range.end {
            return Err(CoreError::validation("timeRange.start must be <= end"));
        }
        if request.schema.is_empty() {
            return Err(CoreError::validation("schema.fields must not be empty"));
        }

        let dataset = Dataset::ensure(
            dataset_slug,
            writer::FORMAT_COLUMNAR,
            Some(self.default_target.id),
            &self.pool,
        )
        .await?;

        // Idempotency short-circuit.
        if let Some(key) = &request.idempotency_key {
            if let Some(prior) = self.find_receipt(dataset.id, key).await? {
                info!(dataset = dataset_slug, key = %key, "ingest deduplicated by idempotency key");
                return Ok(prior);
            }
        }

        // Schema resolution: bootstrap on first ingest, auto-upgrade on
        // additive evolution, reject anything else.
        let schema_version = match SchemaVersion::latest(dataset.id, &self.pool).await? {
            None => SchemaVersion::create_next(dataset.id, &request.schema, &self.pool).await?,
            Some(current) => {
                let current_schema = current.schema()?;
                match current_schema.compatibility(&request.schema) {
                    SchemaCompatibility::Identical => current,
                    SchemaCompatibility::Additive => {
                        SchemaVersion::create_next(dataset.id, &request.schema, &self.pool).await?
                    }
                    SchemaCompatibility::Incompatible(problems) => {
                        return Err(schema_incompatible(problems))
                    }
                }
            }
        };
        let schema = schema_version.schema()?;

        for row in &request.rows {
            schema.validate_row(row)?;
        }

        let shard = request.partition.shard();
        let signature = ingestion_signature(&dataset.id, &request);

        // Write the partition file before opening the publish transaction.
        let format = dataset.write_format.clone();
        let partition_id = db_id();
        let next_version = self.peek_next_version(dataset.id, &shard).await?;
        let file_path = format!(
            "datasets/{}/{}/{}/{}.{}",
            dataset.slug,
            shard,
            next_version,
            partition_id,
            writer::file_extension(&format)
        );
        let written =
            write_partition(self.storage.as_ref(), &file_path, &format, &schema, &request.rows)
                .await?;

        let column_statistics =
            serde_json::Value::Object(compute_column_stats(&schema, &request.rows));
        let column_bloom_filters = build_bloom_filters(&schema, &request.rows);

        let storage_target_id = request
            .storage_target_id
            .or(dataset.default_storage_target_id)
            .unwrap_or(self.default_target.id);

        // Survivors of the previous published manifest carry over.
        let carry_over: Vec<Uuid> = match self.engine.latest_published(dataset.id, &shard).await? {
            Some((_, partitions)) => partitions.iter().map(|p| p.id).collect(),
            None => Vec::new(),
        };

        let published = self
            .engine
            .publish(PublishManifest {
                dataset_id: dataset.id,
                manifest_shard: shard.clone(),
                schema_version_id: Some(schema_version.id),
                partitions: vec![NewPartition {
                    partition_key: serde_json::Value::Object(request.partition.key.clone()),
                    storage_target_id,
                    file_format: format.clone(),
                    file_path: written.file_path.clone(),
                    file_size_bytes: Some(written.file_size_bytes),
                    row_count: Some(request.rows.len() as i64),
                    start_time: request.partition.time_range.start,
                    end_time: request.partition.time_range.end,
                    checksum: Some(written.checksum.clone()),
                    metadata: serde_json::Value::Object(
                        request.partition.attributes.clone().unwrap_or_default(),
                    ),
                    column_statistics,
                    column_bloom_filters,
                    ingestion_signature: Some(signature.clone()),
                }],
                summary: serde_json::json!({"ingest": {"rows": request.rows.len()}}),
                created_by: request.actor.clone(),
                carry_over_partition_ids: carry_over,
            })
            .await?;

        let partition_row = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM dataset_partitions
            WHERE manifest_id = $1 AND ingestion_signature = $2
            "#,
        )
        .bind(published.id)
        .bind(&signature)
        .fetch_optional(&self.pool)
        .await?;

        let outcome = IngestOutcome {
            dataset_id: dataset.id,
            manifest_id: Some(published.id),
            manifest_version: Some(published.version),
            partition_id: partition_row,
            deduplicated: false,
            mode: "inline".to_string(),
        };

        if let Some(key) = &request.idempotency_key {
            self.record_receipt(dataset.id, key, &outcome).await?;
        }

        audit::record_lifecycle_event(
            &self.pool,
            &self.metrics,
            dataset.id,
            Some(published.id),
            "ingest.partition",
            serde_json::json!({
                "rows": request.rows.len(),
                "shard": shard,
                "manifestVersion": published.version,
            }),
        )
        .await;
        self.metrics.ingestions.with_label_values(&["inline"]).inc();

        Ok(outcome)
    }

    async fn peek_next_version(&self, dataset_id: Uuid, shard: &str) -> CoreResult<i32> {
        let version: i32 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(version), 0) + 1
            FROM dataset_manifests
            WHERE dataset_id = $1 AND manifest_shard = $2
            "#,
        )
        .bind(dataset_id)
        .bind(shard)
        .fetch_one(&self.pool)
        .await?;
        Ok(version)
    }

    async fn find_receipt(&self, dataset_id: Uuid, key: &str) -> CoreResult<Option<IngestOutcome>> {
        let row: Option<(Option<Uuid>, Option<Uuid>, String)> = sqlx::query_as(
            r#"
            SELECT manifest_id, partition_id, mode
            FROM ingestion_receipts
            WHERE dataset_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(dataset_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(manifest_id, partition_id, mode)| IngestOutcome {
            dataset_id,
            manifest_id,
            manifest_version: None,
            partition_id,
            deduplicated: true,
            mode,
        }))
    }

    async fn record_receipt(
        &self,
        dataset_id: Uuid,
        key: &str,
        outcome: &IngestOutcome,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_receipts (
                id, dataset_id, idempotency_key, manifest_id, partition_id, mode
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (dataset_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(db_id())
        .bind(dataset_id)
        .bind(key)
        .bind(outcome.manifest_id)
        .bind(outcome.partition_id)
        .bind(&outcome.mode)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Content signature: schema + partition key + time range + rows. Identical
/// submissions collide per manifest, which is the dedupe the partition
/// unique constraint enforces.
fn ingestion_signature(dataset_id: &Uuid, request: &IngestRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dataset_id.as_bytes());
    hasher.update(
        serde_json::to_vec(&request.schema).unwrap_or_default(),
    );
    hasher.update(
        serde_json::to_vec(&request.partition.key).unwrap_or_default(),
    );
    hasher.update(
        request
            .partition
            .time_range
            .start
            .timestamp_micros()
            .to_be_bytes(),
    );
    hasher.update(
        request
            .partition
            .time_range
            .end
            .timestamp_micros()
            .to_be_bytes(),
    );
    hasher.update(serde_json::to_vec(&request.rows).unwrap_or_default());
    if let Some(key) = &request.idempotency_key {
        hasher.update(key.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn build_bloom_filters(schema: &SchemaDef, rows: &[serde_json::Value]) -> serde_json::Value {
    let mut filters = serde_json::Map::new();
    for field in &schema.fields {
        if field.field_type != crate::domains::datasets::FieldType::String {
            continue;
        }
        let values: Vec<&str> = rows
            .iter()
            .filter_map(|row| row.get(&field.name).and_then(|v| v.as_str()))
            .collect();
        if values.is_empty() {
            continue;
        }
        let filter = BloomFilter::build(values);
        if let Ok(value) = serde_json::to_value(&filter) {
            filters.insert(field.name.clone(), value);
        }
    }
    serde_json::Value::Object(filters)
}

// ============================================================================
// Queued mode
// ============================================================================

/// Queue payload for deferred ingestion.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedIngest {
    pub dataset_slug: String,
    pub request: IngestRequest,
}

pub struct IngestJobHandler {
    pipeline: Arc<IngestPipeline>,
}

impl IngestJobHandler {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl QueueHandler for IngestJobHandler {
    async fn handle(&self, job: JobEnvelope) -> CoreResult<()> {
        let queued: QueuedIngest = serde_json::from_value(job.payload)?;
        self.pipeline
            .ingest(&queued.dataset_slug, queued.request)
            .await?;
        Ok(())
    }
}

/// Read back partition rows for the executor.
pub async fn read_partition_rows(
    storage: &dyn StorageDriver,
    partition: &DatasetPartition,
) -> CoreResult<Vec<serde_json::Value>> {
    let data = storage.get(&partition.file_path).await?;
    writer::decode_rows(&partition.file_format, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::datasets::FieldDef;

    fn request() -> IngestRequest {
        IngestRequest {
            schema: SchemaDef {
                fields: vec![
                    FieldDef {
                        name: "timestamp".to_string(),
                        field_type: crate::domains::datasets::FieldType::Timestamp,
                    },
                    FieldDef {
                        name: "host".to_string(),
                        field_type: crate::domains::datasets::FieldType::String,
                    },
                ],
            },
            partition: PartitionSpec {
                key: serde_json::Map::new(),
                attributes: None,
                time_range: TimeRange {
                    start: Utc::now(),
                    end: Utc::now(),
                },
            },
            rows: vec![serde_json::json!({"timestamp": "2024-01-01T00:00:00Z", "host": "a"})],
            idempotency_key: Some("key-1".to_string()),
            actor: None,
            storage_target_id: None,
            table_name: None,
        }
    }

    #[test]
    fn signature_is_stable_and_content_sensitive() {
        let dataset = Uuid::now_v7();
        let a = ingestion_signature(&dataset, &request());
        let b = ingestion_signature(&dataset, &request());
        assert_eq!(a, b);

        let mut changed = request();
        changed.rows.push(serde_json::json!({"host": "b"}));
        assert_ne!(a, ingestion_signature(&dataset, &changed));

        let other_dataset = Uuid::now_v7();
        assert_ne!(a, ingestion_signature(&other_dataset, &request()));
    }

    #[test]
    fn shard_resolution_defaults() {
        let mut spec = request().partition;
        assert_eq!(spec.shard(), "default");
        let mut attrs = serde_json::Map::new();
        attrs.insert("shard".to_string(), serde_json::json!("2024-01"));
        spec.attributes = Some(attrs);
        assert_eq!(spec.shard(), "2024-01");
    }

    #[test]
    fn bloom_filters_cover_string_columns_only() {
        let req = request();
        let filters = build_bloom_filters(&req.schema, &req.rows);
        assert!(filters.get("host").is_some());
        assert!(filters.get("timestamp").is_none());
    }

    #[test]
    fn request_serialization_round_trips() {
        let req = request();
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["idempotencyKey"], "key-1");
        let back: IngestRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back.idempotency_key.as_deref(), Some("key-1"));
        assert_eq!(back.rows.len(), 1);
    }
}
