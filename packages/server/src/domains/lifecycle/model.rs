//! Lifecycle job run rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};
use crate::common::ids::db_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleOperation {
    Compaction,
    Retention,
    PostgresMigration,
}

impl LifecycleOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleOperation::Compaction => "compaction",
            LifecycleOperation::Retention => "retention",
            LifecycleOperation::PostgresMigration => "postgres_migration",
        }
    }

    /// `parquetExport` appears in some deployments as the spelling for the
    /// relational offload; both names run the same migration engine.
    pub fn parse(value: &str) -> CoreResult<Self> {
        match value {
            "compaction" => Ok(LifecycleOperation::Compaction),
            "retention" => Ok(LifecycleOperation::Retention),
            "postgres_migration" | "parquetExport" | "parquet_export" => {
                Ok(LifecycleOperation::PostgresMigration)
            }
            other => Err(CoreError::validation(format!(
                "unknown lifecycle operation {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Schedule,
    Manual,
    Retry,
    Api,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Schedule => "schedule",
            TriggerSource::Manual => "manual",
            TriggerSource::Retry => "retry",
            TriggerSource::Api => "api",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "lifecycle_run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LifecycleRunStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleJobRun {
    pub id: Uuid,
    pub job_kind: String,
    pub dataset_id: Option<Uuid>,
    pub operations: serde_json::Value,
    pub trigger_source: String,
    pub status: LifecycleRunStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const RUN_COLUMNS: &str = r#"id, job_kind, dataset_id, operations, trigger_source, status,
           scheduled_for, started_at, completed_at, duration_ms, error,
           metadata, created_at, updated_at"#;

impl LifecycleJobRun {
    pub fn parsed_operations(&self) -> CoreResult<Vec<LifecycleOperation>> {
        let names: Vec<String> = serde_json::from_value(self.operations.clone())
            .map_err(|e| CoreError::validation(format!("invalid operations list: {e}")))?;
        names.iter().map(|n| LifecycleOperation::parse(n)).collect()
    }

    pub async fn create(
        dataset_id: Uuid,
        operations: &[LifecycleOperation],
        trigger: TriggerSource,
        scheduled_for: Option<DateTime<Utc>>,
        pool: &PgPool,
    ) -> CoreResult<Self> {
        let names: Vec<&str> = operations.iter().map(|o| o.as_str()).collect();
        let row = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO lifecycle_job_runs (
                id, job_kind, dataset_id, operations, trigger_source, status,
                scheduled_for
            )
            VALUES ($1, 'dataset-maintenance', $2, $3, $4, 'pending', $5)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(db_id())
        .bind(dataset_id)
        .bind(serde_json::json!(names))
        .bind(trigger.as_str())
        .bind(scheduled_for)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    pub async fn find(id: Uuid, pool: &PgPool) -> CoreResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(&format!("SELECT {RUN_COLUMNS} FROM lifecycle_job_runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    pub async fn mark_running(id: Uuid, pool: &PgPool) -> CoreResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE lifecycle_job_runs
            SET status = 'running', started_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn complete(
        id: Uuid,
        status: LifecycleRunStatus,
        error: Option<&str>,
        metadata: serde_json::Value,
        pool: &PgPool,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE lifecycle_job_runs
            SET status = $2,
                error = $3,
                metadata = metadata || $4,
                completed_at = NOW(),
                duration_ms = EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .bind(&metadata)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn recent(limit: i64, pool: &PgPool) -> CoreResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(&format!(
            "SELECT {RUN_COLUMNS} FROM lifecycle_job_runs ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_parsing_accepts_both_export_spellings() {
        assert_eq!(
            LifecycleOperation::parse("postgres_migration").unwrap(),
            LifecycleOperation::PostgresMigration
        );
        assert_eq!(
            LifecycleOperation::parse("parquetExport").unwrap(),
            LifecycleOperation::PostgresMigration
        );
        assert_eq!(
            LifecycleOperation::parse("compaction").unwrap(),
            LifecycleOperation::Compaction
        );
        assert!(LifecycleOperation::parse("vacuum").is_err());
    }
}
