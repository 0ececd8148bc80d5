//! Append-only audit trails.
//!
//! Two streams: lifecycle events (manifest publications, retention drops,
//! compaction rewrites) and dataset access events (ingest/query/sql
//! authorization outcomes). Appends never fail the caller; failures are
//! logged and counted.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::warn;
use uuid::Uuid;

use crate::common::error::CoreResult;
use crate::common::ids::db_id;
use crate::kernel::metrics::Metrics;

#[derive(Debug, Clone, FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleAuditLogEntry {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub manifest_id: Option<Uuid>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetAccessAuditEvent {
    pub id: Uuid,
    pub dataset_id: Option<Uuid>,
    pub dataset_slug: String,
    pub actor_id: Option<String>,
    pub scopes: Vec<String>,
    pub action: String,
    pub success: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append a lifecycle audit entry. Never throws to the caller.
pub async fn record_lifecycle_event(
    pool: &PgPool,
    metrics: &Metrics,
    dataset_id: Uuid,
    manifest_id: Option<Uuid>,
    event_type: &str,
    payload: serde_json::Value,
) {
    let result = sqlx::query(
        r#"
        INSERT INTO lifecycle_audit_log (id, dataset_id, manifest_id, event_type, payload)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(db_id())
    .bind(dataset_id)
    .bind(manifest_id)
    .bind(event_type)
    .bind(&payload)
    .execute(pool)
    .await;
    if let Err(e) = result {
        metrics.audit_write_failures.inc();
        warn!(dataset_id = %dataset_id, event_type, error = %e, "lifecycle audit append failed");
    }
}

/// Append a dataset access event. Never throws to the caller.
#[allow(clippy::too_many_arguments)]
pub async fn record_access_event(
    pool: &PgPool,
    metrics: &Metrics,
    dataset_id: Option<Uuid>,
    dataset_slug: &str,
    actor_id: Option<&str>,
    scopes: Vec<String>,
    action: &str,
    success: bool,
    metadata: serde_json::Value,
) {
    let result = sqlx::query(
        r#"
        INSERT INTO dataset_access_audit (
            id, dataset_id, dataset_slug, actor_id, scopes, action, success, metadata
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(db_id())
    .bind(dataset_id)
    .bind(dataset_slug)
    .bind(actor_id)
    .bind(&scopes)
    .bind(action)
    .bind(success)
    .bind(&metadata)
    .execute(pool)
    .await;
    if let Err(e) = result {
        metrics.audit_write_failures.inc();
        warn!(dataset_slug, action, error = %e, "access audit append failed");
    }
}

/// Lifecycle audit entries for a dataset, newest first.
pub async fn lifecycle_entries(
    pool: &PgPool,
    dataset_id: Uuid,
    limit: i64,
) -> CoreResult<Vec<LifecycleAuditLogEntry>> {
    let rows = sqlx::query_as::<_, LifecycleAuditLogEntry>(
        r#"
        SELECT id, dataset_id, manifest_id, event_type, payload, created_at
        FROM lifecycle_audit_log
        WHERE dataset_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(dataset_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Access audit events for a dataset, newest first.
pub async fn access_events(
    pool: &PgPool,
    dataset_id: Uuid,
    limit: i64,
) -> CoreResult<Vec<DatasetAccessAuditEvent>> {
    let rows = sqlx::query_as::<_, DatasetAccessAuditEvent>(
        r#"
        SELECT id, dataset_id, dataset_slug, actor_id, scopes, action, success,
               metadata, created_at
        FROM dataset_access_audit
        WHERE dataset_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(dataset_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
