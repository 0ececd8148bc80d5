//! Relational-to-columnar migration.
//!
//! Discovers tables carrying a `dataset_id` column plus a time column, ships
//! rows older than the age cutoff to the columnar backend, and records a
//! watermark per `(dataset, table)` so reruns resume where they stopped.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::metrics::LifecycleMetrics;
use crate::common::error::CoreResult;
use crate::domains::columnar::ColumnarDriver;

const TIME_COLUMNS: &[&str] = &["created_at", "updated_at", "started_at"];
const BATCH_SIZE: i64 = 1_000;

/// A migratable table: has `dataset_id` and one of the known time columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratableTable {
    pub table_name: String,
    pub time_column: String,
}

/// Discover migratable tables from the catalog.
pub async fn discover_tables(pool: &PgPool) -> CoreResult<Vec<MigratableTable>> {
    let rows = sqlx::query(
        r#"
        SELECT c.table_name, c.column_name
        FROM information_schema.columns c
        WHERE c.table_schema = 'public'
          AND c.column_name = ANY($1)
          AND EXISTS (
            SELECT 1 FROM information_schema.columns d
            WHERE d.table_schema = 'public'
              AND d.table_name = c.table_name
              AND d.column_name = 'dataset_id'
          )
        ORDER BY c.table_name, c.column_name
        "#,
    )
    .bind(TIME_COLUMNS)
    .fetch_all(pool)
    .await?;

    // One entry per table; the first matching time column wins in the
    // TIME_COLUMNS preference order.
    let mut tables: Vec<MigratableTable> = Vec::new();
    let mut by_table: std::collections::BTreeMap<String, Vec<String>> =
        std::collections::BTreeMap::new();
    for row in rows {
        let table: String = row.get("table_name");
        let column: String = row.get("column_name");
        by_table.entry(table).or_default().push(column);
    }
    for (table_name, columns) in by_table {
        if let Some(time_column) = TIME_COLUMNS
            .iter()
            .find(|preferred| columns.iter().any(|c| c == *preferred))
        {
            tables.push(MigratableTable {
                table_name,
                time_column: time_column.to_string(),
            });
        }
    }
    Ok(tables)
}

async fn watermark_for(
    pool: &PgPool,
    dataset_id: Uuid,
    table: &str,
) -> CoreResult<Option<DateTime<Utc>>> {
    let row = sqlx::query_scalar::<_, DateTime<Utc>>(
        r#"
        SELECT watermark FROM migration_watermarks
        WHERE dataset_id = $1 AND table_name = $2
        "#,
    )
    .bind(dataset_id)
    .bind(table)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

async fn advance_watermark(
    pool: &PgPool,
    dataset_id: Uuid,
    table: &str,
    watermark: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO migration_watermarks (dataset_id, table_name, watermark)
        VALUES ($1, $2, $3)
        ON CONFLICT (dataset_id, table_name) DO UPDATE SET
            watermark = EXCLUDED.watermark,
            updated_at = NOW()
        "#,
    )
    .bind(dataset_id)
    .bind(table)
    .bind(watermark)
    .execute(pool)
    .await?;
    Ok(())
}

pub struct MigrationOutcome {
    pub tables_processed: usize,
    pub rows_migrated: i64,
}

/// Migrate one dataset's aged relational rows to the columnar backend.
pub async fn run_migration(
    dataset_id: Uuid,
    age_hours: i64,
    grace_minutes: i64,
    pool: &PgPool,
    columnar: &Arc<dyn ColumnarDriver>,
    metrics: &LifecycleMetrics,
) -> CoreResult<MigrationOutcome> {
    let cutoff = Utc::now() - Duration::hours(age_hours) - Duration::minutes(grace_minutes);
    let tables = discover_tables(pool).await?;

    let mut rows_migrated = 0i64;
    for table in &tables {
        let since = watermark_for(pool, dataset_id, &table.table_name).await?;

        loop {
            // row_to_json keeps the shape faithful without per-table structs.
            let sql = format!(
                r#"
                SELECT row_to_json(t) AS row, t.{time} AS ts
                FROM {table} t
                WHERE t.dataset_id = $1
                  AND t.{time} < $2
                  AND ($3::timestamptz IS NULL OR t.{time} > $3)
                ORDER BY t.{time}
                LIMIT $4
                "#,
                time = table.time_column,
                table = table.table_name,
            );
            let batch = sqlx::query(&sql)
                .bind(dataset_id)
                .bind(cutoff)
                .bind(since)
                .bind(BATCH_SIZE)
                .fetch_all(pool)
                .await?;
            if batch.is_empty() {
                break;
            }

            let rows: Vec<serde_json::Value> =
                batch.iter().map(|r| r.get::<serde_json::Value, _>("row")).collect();
            let last_ts: DateTime<Utc> = batch
                .last()
                .map(|r| r.get("ts"))
                .unwrap_or(cutoff);

            columnar
                .insert_rows(&table.table_name, &rows)
                .await?;
            advance_watermark(pool, dataset_id, &table.table_name, last_ts).await?;
            rows_migrated += rows.len() as i64;

            if (batch.len() as i64) < BATCH_SIZE {
                break;
            }
        }
    }

    metrics.record_operation("postgres_migration", 0, rows_migrated);
    info!(
        dataset_id = %dataset_id,
        tables = tables.len(),
        rows = rows_migrated,
        "postgres migration pass complete"
    );

    Ok(MigrationOutcome {
        tables_processed: tables.len(),
        rows_migrated,
    })
}
