//! Query execution over pruned partitions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::downsample::{downsample_columns, downsample_rows, Downsample};
use super::planner::{plan, row_matches, Filter};
use crate::common::error::{CoreError, CoreResult};
use crate::domains::columnar::ColumnarDriver;
use crate::domains::datasets::{
    CachedManifest, Dataset, DatasetManifest, DatasetPartition, ManifestCache, ManifestEngine,
};
use crate::domains::ingest::{read_partition_rows, TimeRange};
use crate::kernel::metrics::Metrics;
use crate::kernel::storage::StorageDriver;

pub const DEFAULT_ROW_LIMIT: i64 = 10_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub time_range: TimeRange,
    #[serde(default)]
    pub timestamp_column: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub filters: Option<Vec<Filter>>,
    #[serde(default)]
    pub downsample: Option<Downsample>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub rows: Vec<serde_json::Value>,
    pub columns: Vec<String>,
    pub mode: String,
    pub warnings: Vec<String>,
}

pub struct QueryExecutor {
    pool: PgPool,
    engine: Arc<ManifestEngine>,
    cache: Arc<dyn ManifestCache>,
    storage: Arc<dyn StorageDriver>,
    columnar: Option<Arc<dyn ColumnarDriver>>,
    metrics: Metrics,
}

impl QueryExecutor {
    pub fn new(
        pool: PgPool,
        engine: Arc<ManifestEngine>,
        cache: Arc<dyn ManifestCache>,
        storage: Arc<dyn StorageDriver>,
        columnar: Option<Arc<dyn ColumnarDriver>>,
        metrics: Metrics,
    ) -> Self {
        Self {
            pool,
            engine,
            cache,
            storage,
            columnar,
            metrics,
        }
    }

    /// Published lanes, cache first.
    async fn load_lanes(&self, dataset_id: Uuid) -> CoreResult<Vec<CachedManifest>> {
        let manifests = DatasetManifest::published_for_dataset(dataset_id, &self.pool).await?;
        let mut lanes = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            if let Some(cached) = self
                .cache
                .get_latest_published(dataset_id, &manifest.manifest_shard)
                .await
            {
                // The cache may lag one publication; version match keeps it
                // honest.
                if cached.manifest.version == manifest.version {
                    lanes.push(cached);
                    continue;
                }
            }
            let partitions = DatasetPartition::for_manifest(manifest.id, &self.pool).await?;
            let entry = CachedManifest {
                manifest,
                partitions,
            };
            self.cache.put(entry.clone()).await;
            lanes.push(entry);
        }
        Ok(lanes)
    }

    pub async fn query(
        &self,
        dataset: &Dataset,
        request: QueryRequest,
    ) -> CoreResult<QueryResponse> {
        if request.time_range.start > request.time_range.end {
            return Err(CoreError::validation("timeRange.start must be <= end"));
        }
        let limit = request.limit.unwrap_or(DEFAULT_ROW_LIMIT);
        if limit <= 0 {
            return Err(CoreError::validation("limit must be positive"));
        }
        let limit = limit.min(DEFAULT_ROW_LIMIT) as usize;
        let timestamp_column = request
            .timestamp_column
            .clone()
            .unwrap_or_else(|| "timestamp".to_string());
        let filters = request.filters.clone().unwrap_or_default();

        let lanes = self.load_lanes(dataset.id).await?;
        let all_partitions: Vec<DatasetPartition> = lanes
            .into_iter()
            .flat_map(|lane| lane.partitions)
            .collect();

        let plan = plan(&all_partitions, &request.time_range, &filters);
        let mut warnings = Vec::new();
        let mut rows: Vec<serde_json::Value> = Vec::new();

        for partition in &plan.partitions {
            if partition.file_path.contains("://") {
                // Remote partitions live behind the columnar backend.
                match &self.columnar {
                    Some(driver) => {
                        let table = partition
                            .metadata
                            .get("table")
                            .and_then(|v| v.as_str())
                            .unwrap_or(&dataset.slug);
                        match driver
                            .query_json(&format!(
                                "SELECT * FROM {table} WHERE {timestamp_column} >= '{}' AND {timestamp_column} <= '{}'",
                                request.time_range.start.to_rfc3339(),
                                request.time_range.end.to_rfc3339(),
                            ))
                            .await
                        {
                            Ok(remote) => rows.extend(remote),
                            Err(e) => warnings.push(format!(
                                "remote partition {} skipped: {}",
                                partition.id, e.message
                            )),
                        }
                    }
                    None => warnings.push(format!(
                        "remote partition {} skipped: no columnar backend configured",
                        partition.id
                    )),
                }
                continue;
            }

            let partition_rows = read_partition_rows(self.storage.as_ref(), partition).await?;
            rows.extend(partition_rows);
        }

        rows.retain(|row| row_matches(row, &timestamp_column, &request.time_range, &filters));
        rows.sort_by(|a, b| {
            let ts_a = a.get(&timestamp_column).and_then(|v| v.as_str()).unwrap_or("");
            let ts_b = b.get(&timestamp_column).and_then(|v| v.as_str()).unwrap_or("");
            ts_a.cmp(ts_b)
        });

        self.metrics.queries.inc();

        if let Some(downsample) = &request.downsample {
            let aggregated = downsample_rows(&rows, &timestamp_column, downsample)?;
            let truncated = aggregated.len() > limit;
            let mut rows = aggregated;
            rows.truncate(limit);
            if truncated {
                warnings.push(format!("result truncated to {limit} buckets"));
            }
            return Ok(QueryResponse {
                rows,
                columns: downsample_columns(downsample),
                mode: "downsampled".to_string(),
                warnings,
            });
        }

        if rows.len() > limit {
            warnings.push(format!("result truncated to {limit} rows"));
            rows.truncate(limit);
        }

        // Projection.
        if let Some(projection) = &request.columns {
            let mut keep: Vec<String> = projection.clone();
            if !keep.contains(&timestamp_column) {
                keep.insert(0, timestamp_column.clone());
            }
            rows = rows
                .into_iter()
                .map(|row| {
                    let mut projected = serde_json::Map::new();
                    if let Some(obj) = row.as_object() {
                        for column in &keep {
                            if let Some(value) = obj.get(column) {
                                projected.insert(column.clone(), value.clone());
                            }
                        }
                    }
                    serde_json::Value::Object(projected)
                })
                .collect();
        }

        let columns = result_columns(&rows, &timestamp_column, request.columns.as_deref());

        Ok(QueryResponse {
            rows,
            columns,
            mode: "raw".to_string(),
            warnings,
        })
    }

    pub fn engine(&self) -> &Arc<ManifestEngine> {
        &self.engine
    }
}

/// Stable column list: timestamp first, then the requested projection or the
/// sorted union of observed keys.
fn result_columns(
    rows: &[serde_json::Value],
    timestamp_column: &str,
    projection: Option<&[String]>,
) -> Vec<String> {
    if let Some(projection) = projection {
        let mut columns = vec![timestamp_column.to_string()];
        for column in projection {
            if column != timestamp_column {
                columns.push(column.clone());
            }
        }
        return columns;
    }

    let mut keys: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for row in rows {
        if let Some(obj) = row.as_object() {
            keys.extend(obj.keys().cloned());
        }
    }
    let mut columns = Vec::with_capacity(keys.len());
    if keys.remove(timestamp_column) {
        columns.push(timestamp_column.to_string());
    }
    columns.extend(keys);
    columns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_columns_put_timestamp_first() {
        let rows = vec![
            serde_json::json!({"v": 1, "timestamp": "t", "host": "a"}),
            serde_json::json!({"extra": true}),
        ];
        assert_eq!(
            result_columns(&rows, "timestamp", None),
            vec!["timestamp", "extra", "host", "v"]
        );
        assert_eq!(
            result_columns(&rows, "timestamp", Some(&["v".to_string()])),
            vec!["timestamp", "v"]
        );
    }
}
