//! Manifest publication engine.
//!
//! One transaction per publication: compute the next version for the
//! `(dataset, shard)` lane, insert the draft manifest and its partitions,
//! supersede the previous published manifest, flip the new one to published.
//! A per-lane advisory lock serializes publications; the cache bus is
//! notified only after commit.

use chrono::Utc;
use sqlx::postgres::PgPool;
use tracing::info;
use uuid::Uuid;

use super::model::{DatasetManifest, DatasetPartition, ManifestStatus, NewPartition};
use crate::common::error::{CoreError, CoreResult};
use crate::common::ids::db_id;
use crate::kernel::invalidation::InvalidationBus;

/// Publication request.
#[derive(Debug, Clone)]
pub struct PublishManifest {
    pub dataset_id: Uuid,
    pub manifest_shard: String,
    pub schema_version_id: Option<Uuid>,
    pub partitions: Vec<NewPartition>,
    pub summary: serde_json::Value,
    pub created_by: Option<String>,
    /// Partition ids carried over from the parent manifest (compaction and
    /// retention republish survivors by reference).
    pub carry_over_partition_ids: Vec<Uuid>,
}

impl PublishManifest {
    pub fn new(dataset_id: Uuid, shard: impl Into<String>) -> Self {
        Self {
            dataset_id,
            manifest_shard: shard.into(),
            schema_version_id: None,
            partitions: Vec::new(),
            summary: serde_json::json!({}),
            created_by: None,
            carry_over_partition_ids: Vec::new(),
        }
    }
}

pub struct ManifestEngine {
    pool: PgPool,
    bus: InvalidationBus,
}

impl ManifestEngine {
    pub fn new(pool: PgPool, bus: InvalidationBus) -> Self {
        Self { pool, bus }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Publish a new manifest version. Post-commit there is exactly one
    /// published manifest for the `(dataset, shard)` lane.
    pub async fn publish(&self, req: PublishManifest) -> CoreResult<DatasetManifest> {
        // Reject signature collisions within the batch before touching the
        // database.
        {
            let mut seen = std::collections::HashSet::new();
            for partition in &req.partitions {
                if let Some(sig) = &partition.ingestion_signature {
                    if !seen.insert(sig.clone()) {
                        return Err(CoreError::duplicate(format!(
                            "ingestion signature {sig} repeated in batch"
                        )));
                    }
                }
                if partition.start_time > partition.end_time {
                    return Err(CoreError::validation(
                        "partition startTime must be <= endTime",
                    ));
                }
            }
        }

        let mut tx = self.pool.begin().await?;

        // Serialize publications per (dataset, shard) lane.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || ':' || $2))")
            .bind(req.dataset_id.to_string())
            .bind(&req.manifest_shard)
            .execute(&mut *tx)
            .await?;

        let next_version: i32 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(version), 0) + 1
            FROM dataset_manifests
            WHERE dataset_id = $1 AND manifest_shard = $2
            "#,
        )
        .bind(req.dataset_id)
        .bind(&req.manifest_shard)
        .fetch_one(&mut *tx)
        .await?;

        let prior: Option<DatasetManifest> = sqlx::query_as(&format!(
            r#"{}
            WHERE dataset_id = $1 AND manifest_shard = $2 AND status = 'published'
            FOR UPDATE"#,
            super::model::MANIFEST_SELECT
        ))
        .bind(req.dataset_id)
        .bind(&req.manifest_shard)
        .fetch_optional(&mut *tx)
        .await?;

        let manifest_id = db_id();
        sqlx::query(
            r#"
            INSERT INTO dataset_manifests (
                id, dataset_id, version, status, schema_version_id,
                parent_manifest_id, manifest_shard, summary, created_by
            )
            VALUES ($1, $2, $3, 'draft', $4, $5, $6, $7, $8)
            "#,
        )
        .bind(manifest_id)
        .bind(req.dataset_id)
        .bind(next_version)
        .bind(req.schema_version_id)
        .bind(prior.as_ref().map(|m| m.id))
        .bind(&req.manifest_shard)
        .bind(&req.summary)
        .bind(&req.created_by)
        .execute(&mut *tx)
        .await?;

        // Re-attach surviving partitions from the parent manifest.
        let mut partition_count = 0i32;
        let mut total_rows = 0i64;
        let mut total_bytes = 0i64;
        if !req.carry_over_partition_ids.is_empty() {
            let carried = sqlx::query_as::<_, DatasetPartition>(
                r#"
                INSERT INTO dataset_partitions (
                    id, dataset_id, manifest_id, partition_key,
                    storage_target_id, file_format, file_path, file_size_bytes,
                    row_count, start_time, end_time, checksum, metadata,
                    column_statistics, column_bloom_filters, ingestion_signature
                )
                SELECT gen_random_uuid(), dataset_id, $1, partition_key,
                       storage_target_id, file_format, file_path,
                       file_size_bytes, row_count, start_time, end_time,
                       checksum, metadata, column_statistics,
                       column_bloom_filters, ingestion_signature
                FROM dataset_partitions
                WHERE id = ANY($2)
                RETURNING id, dataset_id, manifest_id, partition_key,
                          storage_target_id, file_format, file_path,
                          file_size_bytes, row_count, start_time, end_time,
                          checksum, metadata, column_statistics,
                          column_bloom_filters, ingestion_signature, created_at
                "#,
            )
            .bind(manifest_id)
            .bind(&req.carry_over_partition_ids)
            .fetch_all(&mut *tx)
            .await?;
            for p in &carried {
                partition_count += 1;
                total_rows += p.row_count.unwrap_or(0);
                total_bytes += p.file_size_bytes.unwrap_or(0);
            }
        }

        for partition in &req.partitions {
            sqlx::query(
                r#"
                INSERT INTO dataset_partitions (
                    id, dataset_id, manifest_id, partition_key,
                    storage_target_id, file_format, file_path, file_size_bytes,
                    row_count, start_time, end_time, checksum, metadata,
                    column_statistics, column_bloom_filters, ingestion_signature
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                        $13, $14, $15, $16)
                "#,
            )
            .bind(db_id())
            .bind(req.dataset_id)
            .bind(manifest_id)
            .bind(&partition.partition_key)
            .bind(partition.storage_target_id)
            .bind(&partition.file_format)
            .bind(&partition.file_path)
            .bind(partition.file_size_bytes)
            .bind(partition.row_count)
            .bind(partition.start_time)
            .bind(partition.end_time)
            .bind(&partition.checksum)
            .bind(&partition.metadata)
            .bind(&partition.column_statistics)
            .bind(&partition.column_bloom_filters)
            .bind(&partition.ingestion_signature)
            .execute(&mut *tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::duplicate(
                    "ingestion signature collides within manifest",
                ),
                _ => CoreError::from(e),
            })?;
            partition_count += 1;
            total_rows += partition.row_count.unwrap_or(0);
            total_bytes += partition.file_size_bytes.unwrap_or(0);
        }

        if let Some(prior) = &prior {
            sqlx::query(
                r#"
                UPDATE dataset_manifests
                SET status = 'superseded', updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(prior.id)
            .execute(&mut *tx)
            .await?;
        }

        let published = sqlx::query_as::<_, DatasetManifest>(
            r#"
            UPDATE dataset_manifests
            SET status = 'published',
                published_at = $2,
                partition_count = $3,
                total_rows = $4,
                total_bytes = $5,
                statistics = $6,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, dataset_id, version, status, schema_version_id,
                      parent_manifest_id, manifest_shard, summary, statistics,
                      partition_count, total_rows, total_bytes, created_by,
                      created_at, updated_at, published_at
            "#,
        )
        .bind(manifest_id)
        .bind(Utc::now())
        .bind(partition_count)
        .bind(total_rows)
        .bind(total_bytes)
        .bind(serde_json::json!({
            "partitionCount": partition_count,
            "totalRows": total_rows,
            "totalBytes": total_bytes,
        }))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        // Commit-then-invalidate.
        self.bus
            .publish_shard(req.dataset_id, &req.manifest_shard);

        info!(
            dataset_id = %req.dataset_id,
            shard = %req.manifest_shard,
            version = published.version,
            partitions = partition_count,
            "manifest published"
        );
        Ok(published)
    }

    /// Latest published manifest for a lane, straight from the store.
    pub async fn latest_published(
        &self,
        dataset_id: Uuid,
        shard: &str,
    ) -> CoreResult<Option<(DatasetManifest, Vec<DatasetPartition>)>> {
        let Some(manifest) =
            DatasetManifest::latest_published(dataset_id, shard, &self.pool).await?
        else {
            return Ok(None);
        };
        let partitions = DatasetPartition::for_manifest(manifest.id, &self.pool).await?;
        Ok(Some((manifest, partitions)))
    }

    pub fn status_name(status: ManifestStatus) -> &'static str {
        match status {
            ManifestStatus::Draft => "draft",
            ManifestStatus::Published => "published",
            ManifestStatus::Superseded => "superseded",
        }
    }
}
