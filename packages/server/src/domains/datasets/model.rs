//! Dataset, schema version, manifest, partition, and retention rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use super::schema::SchemaDef;
use crate::common::auth::DatasetIamPolicy;
use crate::common::error::{CoreError, CoreResult};
use crate::common::ids::db_id;
use crate::common::pagination::{trim_results, Cursor, Page};

// ============================================================================
// Dataset
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "dataset_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub status: DatasetStatus,
    pub write_format: String,
    pub default_storage_target_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const DATASET_SELECT: &str = r#"
    SELECT id, slug, name, status, write_format, default_storage_target_id,
           metadata, created_at, updated_at
    FROM datasets
"#;

impl Dataset {
    pub fn iam_policy(&self) -> DatasetIamPolicy {
        DatasetIamPolicy::from_metadata(&self.metadata)
    }

    pub async fn find_by_slug(slug: &str, pool: &PgPool) -> CoreResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(&format!("{DATASET_SELECT} WHERE slug = $1"))
            .bind(slug)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> CoreResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(&format!("{DATASET_SELECT} WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    pub async fn require_by_slug(slug: &str, pool: &PgPool) -> CoreResult<Self> {
        Self::find_by_slug(slug, pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("dataset {slug} not found")))
    }

    pub async fn create(
        slug: &str,
        name: &str,
        write_format: &str,
        default_storage_target_id: Option<Uuid>,
        metadata: serde_json::Value,
        pool: &PgPool,
    ) -> CoreResult<Self> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO datasets (id, slug, name, status, write_format,
                                  default_storage_target_id, metadata)
            VALUES ($1, $2, $3, 'active', $4, $5, $6)
            RETURNING id, slug, name, status, write_format,
                      default_storage_target_id, metadata, created_at, updated_at
            "#,
        )
        .bind(db_id())
        .bind(slug)
        .bind(name)
        .bind(write_format)
        .bind(default_storage_target_id)
        .bind(&metadata)
        .fetch_one(pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CoreError::duplicate(format!("dataset {slug} already exists"))
            }
            _ => CoreError::from(e),
        })?;
        Ok(row)
    }

    /// Get-or-create used by ingestion. Lost races resolve to the winner.
    pub async fn ensure(
        slug: &str,
        write_format: &str,
        default_storage_target_id: Option<Uuid>,
        pool: &PgPool,
    ) -> CoreResult<Self> {
        if let Some(existing) = Self::find_by_slug(slug, pool).await? {
            return Ok(existing);
        }
        match Self::create(
            slug,
            slug,
            write_format,
            default_storage_target_id,
            serde_json::json!({}),
            pool,
        )
        .await
        {
            Ok(created) => Ok(created),
            Err(e) if e.kind == crate::common::error::ErrorKind::Duplicate => {
                Self::require_by_slug(slug, pool).await
            }
            Err(e) => Err(e),
        }
    }

    /// Optimistic update: the caller's `if_match` must equal the stored
    /// `updated_at` or the update fails with `concurrent-update`.
    pub async fn update_with_if_match(
        id: Uuid,
        if_match: DateTime<Utc>,
        name: Option<&str>,
        status: Option<DatasetStatus>,
        metadata: Option<&serde_json::Value>,
        pool: &PgPool,
    ) -> CoreResult<Self> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            UPDATE datasets
            SET name = COALESCE($3, name),
                status = COALESCE($4, status),
                metadata = COALESCE($5, metadata),
                updated_at = NOW()
            WHERE id = $1 AND updated_at = $2
            RETURNING id, slug, name, status, write_format,
                      default_storage_target_id, metadata, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(if_match)
        .bind(name)
        .bind(status)
        .bind(metadata)
        .fetch_optional(pool)
        .await?;

        match row {
            Some(updated) => Ok(updated),
            None => {
                // Distinguish not-found from a stale ifMatch.
                match Self::find_by_id(id, pool).await? {
                    Some(_) => Err(CoreError::concurrent_update(
                        "dataset was modified since ifMatch",
                    )),
                    None => Err(CoreError::not_found("dataset not found")),
                }
            }
        }
    }

    pub async fn archive(id: Uuid, pool: &PgPool) -> CoreResult<Self> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            UPDATE datasets
            SET status = 'inactive', updated_at = NOW()
            WHERE id = $1
            RETURNING id, slug, name, status, write_format,
                      default_storage_target_id, metadata, created_at, updated_at
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        row.ok_or_else(|| CoreError::not_found("dataset not found"))
    }

    pub async fn list(
        cursor: Option<Cursor>,
        limit: i64,
        pool: &PgPool,
    ) -> CoreResult<Page<Self>> {
        let rows = match &cursor {
            Some(c) => {
                sqlx::query_as::<_, Self>(&format!(
                    r#"{DATASET_SELECT}
                    WHERE (updated_at, id) < ($1, $2)
                    ORDER BY updated_at DESC, id DESC
                    LIMIT $3"#
                ))
                .bind(c.updated_at)
                .bind(c.id)
                .bind(limit + 1)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Self>(&format!(
                    "{DATASET_SELECT} ORDER BY updated_at DESC, id DESC LIMIT $1"
                ))
                .bind(limit + 1)
                .fetch_all(pool)
                .await?
            }
        };
        let (items, has_more) = trim_results(rows, limit);
        let next_cursor = if has_more {
            items
                .last()
                .map(|d| Cursor::new(d.updated_at, d.id).encode())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    /// All active dataset ids, for the lifecycle scheduler.
    pub async fn active_ids(pool: &PgPool) -> CoreResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM datasets WHERE status = 'active' ORDER BY created_at",
        )
        .fetch_all(pool)
        .await?;
        Ok(ids)
    }
}

// ============================================================================
// Storage targets
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageTarget {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StorageTarget {
    pub async fn find(id: Uuid, pool: &PgPool) -> CoreResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            "SELECT id, name, kind, config, created_at FROM storage_targets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// Idempotently register a storage target by name.
    pub async fn ensure(name: &str, kind: &str, config: serde_json::Value, pool: &PgPool) -> CoreResult<Self> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO storage_targets (id, name, kind, config)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET kind = EXCLUDED.kind, config = EXCLUDED.config
            RETURNING id, name, kind, config, created_at
            "#,
        )
        .bind(db_id())
        .bind(name)
        .bind(kind)
        .bind(&config)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }
}

// ============================================================================
// Schema versions
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersion {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub version: i32,
    pub fields: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SchemaVersion {
    pub fn schema(&self) -> CoreResult<SchemaDef> {
        SchemaDef::from_value(&serde_json::json!({ "fields": self.fields }))
    }

    pub async fn latest(dataset_id: Uuid, pool: &PgPool) -> CoreResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, dataset_id, version, fields, created_at
            FROM dataset_schema_versions
            WHERE dataset_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(dataset_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn find(id: Uuid, pool: &PgPool) -> CoreResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, dataset_id, version, fields, created_at
            FROM dataset_schema_versions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// Append the next schema version for a dataset.
    pub async fn create_next(
        dataset_id: Uuid,
        schema: &SchemaDef,
        pool: &PgPool,
    ) -> CoreResult<Self> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO dataset_schema_versions (id, dataset_id, version, fields)
            VALUES (
                $1, $2,
                COALESCE(
                    (SELECT MAX(version) FROM dataset_schema_versions WHERE dataset_id = $2),
                    0
                ) + 1,
                $3
            )
            RETURNING id, dataset_id, version, fields, created_at
            "#,
        )
        .bind(db_id())
        .bind(dataset_id)
        .bind(serde_json::to_value(&schema.fields)?)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }
}

// ============================================================================
// Manifests and partitions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "manifest_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Draft,
    Published,
    Superseded,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetManifest {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub version: i32,
    pub status: ManifestStatus,
    pub schema_version_id: Option<Uuid>,
    pub parent_manifest_id: Option<Uuid>,
    pub manifest_shard: String,
    pub summary: serde_json::Value,
    pub statistics: serde_json::Value,
    pub partition_count: i32,
    pub total_rows: i64,
    pub total_bytes: i64,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

pub const MANIFEST_SELECT: &str = r#"
    SELECT id, dataset_id, version, status, schema_version_id,
           parent_manifest_id, manifest_shard, summary, statistics,
           partition_count, total_rows, total_bytes, created_by, created_at,
           updated_at, published_at
    FROM dataset_manifests
"#;

impl DatasetManifest {
    pub async fn latest_published(
        dataset_id: Uuid,
        shard: &str,
        pool: &PgPool,
    ) -> CoreResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(&format!(
            r#"{MANIFEST_SELECT}
            WHERE dataset_id = $1 AND manifest_shard = $2 AND status = 'published'"#
        ))
        .bind(dataset_id)
        .bind(shard)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// Every published manifest across shards, for planning.
    pub async fn published_for_dataset(dataset_id: Uuid, pool: &PgPool) -> CoreResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(&format!(
            r#"{MANIFEST_SELECT}
            WHERE dataset_id = $1 AND status = 'published'
            ORDER BY manifest_shard"#
        ))
        .bind(dataset_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_for_dataset(
        dataset_id: Uuid,
        limit: i64,
        pool: &PgPool,
    ) -> CoreResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(&format!(
            r#"{MANIFEST_SELECT}
            WHERE dataset_id = $1
            ORDER BY manifest_shard, version DESC
            LIMIT $2"#
        ))
        .bind(dataset_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetPartition {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub manifest_id: Uuid,
    pub partition_key: serde_json::Value,
    pub storage_target_id: Uuid,
    pub file_format: String,
    pub file_path: String,
    pub file_size_bytes: Option<i64>,
    pub row_count: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub checksum: Option<String>,
    pub metadata: serde_json::Value,
    pub column_statistics: serde_json::Value,
    pub column_bloom_filters: serde_json::Value,
    pub ingestion_signature: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub const PARTITION_SELECT: &str = r#"
    SELECT id, dataset_id, manifest_id, partition_key, storage_target_id,
           file_format, file_path, file_size_bytes, row_count, start_time,
           end_time, checksum, metadata, column_statistics,
           column_bloom_filters, ingestion_signature, created_at
    FROM dataset_partitions
"#;

impl DatasetPartition {
    pub async fn for_manifest(manifest_id: Uuid, pool: &PgPool) -> CoreResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(&format!(
            "{PARTITION_SELECT} WHERE manifest_id = $1 ORDER BY start_time, id"
        ))
        .bind(manifest_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

/// Partition input for manifest publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPartition {
    pub partition_key: serde_json::Value,
    pub storage_target_id: Uuid,
    pub file_format: String,
    pub file_path: String,
    pub file_size_bytes: Option<i64>,
    pub row_count: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub checksum: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub column_statistics: serde_json::Value,
    #[serde(default)]
    pub column_bloom_filters: serde_json::Value,
    pub ingestion_signature: Option<String>,
}

// ============================================================================
// Retention policies
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_hours: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_bytes: Option<i64>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub dataset_id: Uuid,
    pub mode: String,
    pub rules: serde_json::Value,
    pub delete_grace_minutes: i32,
    pub cold_storage_after_hours: Option<i32>,
    pub metadata: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl RetentionPolicy {
    pub fn parsed_rules(&self) -> RetentionRules {
        serde_json::from_value(self.rules.clone()).unwrap_or_default()
    }

    pub async fn find(dataset_id: Uuid, pool: &PgPool) -> CoreResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT dataset_id, mode, rules, delete_grace_minutes,
                   cold_storage_after_hours, metadata, updated_at
            FROM retention_policies
            WHERE dataset_id = $1
            "#,
        )
        .bind(dataset_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn upsert(
        dataset_id: Uuid,
        mode: &str,
        rules: &RetentionRules,
        delete_grace_minutes: i32,
        pool: &PgPool,
    ) -> CoreResult<Self> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO retention_policies (dataset_id, mode, rules, delete_grace_minutes)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (dataset_id) DO UPDATE SET
                mode = EXCLUDED.mode,
                rules = EXCLUDED.rules,
                delete_grace_minutes = EXCLUDED.delete_grace_minutes,
                updated_at = NOW()
            RETURNING dataset_id, mode, rules, delete_grace_minutes,
                      cold_storage_after_hours, metadata, updated_at
            "#,
        )
        .bind(dataset_id)
        .bind(mode)
        .bind(serde_json::to_value(rules)?)
        .bind(delete_grace_minutes)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }
}
