//! Compaction.
//!
//! Groups a manifest's partitions into byte-budgeted chunks per partition
//! key, merges each chunk by time into one replacement file, and publishes a
//! manifest whose partition set swaps the originals for the replacements.
//! Old files are deleted only after the new manifest is published; cleanup
//! failures are logged, never fatal.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

use super::metrics::{ChunkSample, LifecycleMetrics};
use crate::common::error::CoreResult;
use crate::common::ids::db_id;
use crate::domains::datasets::{
    Dataset, DatasetManifest, DatasetPartition, FieldType, ManifestEngine, NewPartition,
    PublishManifest, SchemaDef, SchemaVersion,
};
use crate::domains::ingest::{compute_column_stats, read_partition_rows, writer};
use crate::kernel::storage::StorageDriver;

/// Partitions grouped for one replacement write.
#[derive(Debug)]
pub struct CompactionChunk {
    pub partition_ids: Vec<Uuid>,
}

/// Plan chunks: within each partition-key group, partitions sorted by start
/// time accumulate until the byte budget; only chunks of two or more are
/// worth rewriting.
pub fn plan_chunks(partitions: &[DatasetPartition], chunk_bytes: i64) -> Vec<CompactionChunk> {
    let mut groups: std::collections::BTreeMap<String, Vec<&DatasetPartition>> =
        std::collections::BTreeMap::new();
    for partition in partitions {
        groups
            .entry(partition.partition_key.to_string())
            .or_default()
            .push(partition);
    }

    let mut chunks = Vec::new();
    for (_, mut group) in groups {
        group.sort_by_key(|p| (p.start_time, p.id));
        let mut current: Vec<&DatasetPartition> = Vec::new();
        let mut current_bytes = 0i64;
        for partition in group {
            let size = partition.file_size_bytes.unwrap_or(0);
            if !current.is_empty() && current_bytes + size > chunk_bytes {
                if current.len() >= 2 {
                    chunks.push(CompactionChunk {
                        partition_ids: current.iter().map(|p| p.id).collect(),
                    });
                }
                current = Vec::new();
                current_bytes = 0;
            }
            current.push(partition);
            current_bytes += size;
        }
        if current.len() >= 2 {
            chunks.push(CompactionChunk {
                partition_ids: current.iter().map(|p| p.id).collect(),
            });
        }
    }
    chunks
}

/// Merge chunk rows by time. Identical rows from overlapping partitions keep
/// the copy from the most recently ingested partition.
pub fn merge_chunk_rows(
    timestamp_field: &str,
    mut sources: Vec<(chrono::DateTime<chrono::Utc>, Vec<serde_json::Value>)>,
) -> Vec<serde_json::Value> {
    // Oldest source first so newer duplicates overwrite older ones.
    sources.sort_by_key(|(ingested_at, _)| *ingested_at);

    let mut seen = std::collections::HashMap::new();
    let mut order = 0usize;
    for (_, rows) in sources {
        for row in rows {
            let key = row.to_string();
            // Re-inserting moves the row's precedence to the newer source
            // while keeping one copy.
            seen.insert(key, (order, row));
            order += 1;
        }
    }

    let mut merged: Vec<(usize, serde_json::Value)> = seen.into_values().collect();
    merged.sort_by(|(ord_a, a), (ord_b, b)| {
        let ts_a = a.get(timestamp_field).and_then(|v| v.as_str()).unwrap_or("");
        let ts_b = b.get(timestamp_field).and_then(|v| v.as_str()).unwrap_or("");
        ts_a.cmp(ts_b).then(ord_a.cmp(ord_b))
    });
    merged.into_iter().map(|(_, row)| row).collect()
}

fn timestamp_field(schema: &SchemaDef) -> String {
    schema
        .fields
        .iter()
        .find(|f| f.field_type == FieldType::Timestamp)
        .map(|f| f.name.clone())
        .unwrap_or_else(|| "timestamp".to_string())
}

pub struct CompactionOutcome {
    pub manifest: Option<DatasetManifest>,
    pub chunks_rewritten: usize,
    pub partitions_removed: usize,
    pub bytes_rewritten: i64,
}

/// Run compaction for one `(dataset, shard)` lane.
#[allow(clippy::too_many_arguments)]
pub async fn run_compaction(
    dataset: &Dataset,
    manifest: &DatasetManifest,
    partitions: &[DatasetPartition],
    engine: &ManifestEngine,
    storage: &Arc<dyn StorageDriver>,
    metrics: &LifecycleMetrics,
    chunk_bytes: i64,
) -> CoreResult<CompactionOutcome> {
    let chunks = plan_chunks(partitions, chunk_bytes);
    if chunks.is_empty() {
        return Ok(CompactionOutcome {
            manifest: None,
            chunks_rewritten: 0,
            partitions_removed: 0,
            bytes_rewritten: 0,
        });
    }

    let schema = match manifest.schema_version_id {
        Some(id) => SchemaVersion::find(id, engine.pool())
            .await?
            .map(|v| v.schema())
            .transpose()?
            .unwrap_or_default(),
        None => SchemaDef::default(),
    };
    let ts_field = timestamp_field(&schema);

    let mut replaced_ids: std::collections::HashSet<Uuid> = std::collections::HashSet::new();
    let mut new_partitions = Vec::new();
    let mut old_paths = Vec::new();
    let mut bytes_rewritten = 0i64;

    for chunk in &chunks {
        let started = Instant::now();
        let members: Vec<&DatasetPartition> = partitions
            .iter()
            .filter(|p| chunk.partition_ids.contains(&p.id))
            .collect();

        let mut sources = Vec::with_capacity(members.len());
        let mut chunk_bytes_total = 0i64;
        for member in &members {
            let rows = read_partition_rows(storage.as_ref(), member).await?;
            sources.push((member.created_at, rows));
            chunk_bytes_total += member.file_size_bytes.unwrap_or(0);
        }
        let merged = merge_chunk_rows(&ts_field, sources);

        let start_time = members.iter().map(|p| p.start_time).min().unwrap_or_default();
        let end_time = members.iter().map(|p| p.end_time).max().unwrap_or_default();
        let partition_id = db_id();
        let file_path = format!(
            "datasets/{}/{}/compacted/{}.{}",
            dataset.slug,
            manifest.manifest_shard,
            partition_id,
            writer::file_extension(&dataset.write_format)
        );
        let written = writer::write_partition(
            storage.as_ref(),
            &file_path,
            &dataset.write_format,
            &schema,
            &merged,
        )
        .await?;

        let column_statistics =
            serde_json::Value::Object(compute_column_stats(&schema, &merged));

        new_partitions.push(NewPartition {
            partition_key: members
                .first()
                .map(|p| p.partition_key.clone())
                .unwrap_or(serde_json::json!({})),
            storage_target_id: members
                .first()
                .map(|p| p.storage_target_id)
                .unwrap_or_else(db_id),
            file_format: dataset.write_format.clone(),
            file_path: written.file_path.clone(),
            file_size_bytes: Some(written.file_size_bytes),
            row_count: Some(merged.len() as i64),
            start_time,
            end_time,
            checksum: Some(written.checksum),
            metadata: serde_json::json!({"compactedFrom": chunk.partition_ids.len()}),
            column_statistics,
            column_bloom_filters: serde_json::json!({}),
            ingestion_signature: Some(format!("compaction:{partition_id}")),
        });

        for member in &members {
            replaced_ids.insert(member.id);
            old_paths.push(member.file_path.clone());
        }
        bytes_rewritten += chunk_bytes_total;

        metrics.record_sample(ChunkSample {
            id: partition_id,
            operation: "compaction".to_string(),
            bytes: chunk_bytes_total,
            partitions: members.len(),
            duration_ms: started.elapsed().as_millis() as u64,
            attempts: 1,
        });
    }

    // Survivors keep their rows; replacements take over the chunks.
    let carry_over: Vec<Uuid> = partitions
        .iter()
        .filter(|p| !replaced_ids.contains(&p.id))
        .map(|p| p.id)
        .collect();

    let published = engine
        .publish(PublishManifest {
            dataset_id: dataset.id,
            manifest_shard: manifest.manifest_shard.clone(),
            schema_version_id: manifest.schema_version_id,
            partitions: new_partitions,
            summary: serde_json::json!({
                "compaction": {
                    "chunks": chunks.len(),
                    "replacedPartitions": replaced_ids.len(),
                }
            }),
            created_by: Some("lifecycle:compaction".to_string()),
            carry_over_partition_ids: carry_over,
        })
        .await?;

    // Physical deletes happen only after the publish committed.
    for path in &old_paths {
        if let Err(e) = storage.delete(path).await {
            warn!(path = %path, error = %e, "compacted file cleanup failed");
        }
    }

    metrics.record_operation("compaction", replaced_ids.len() as i64, bytes_rewritten);
    info!(
        dataset = %dataset.slug,
        shard = %manifest.manifest_shard,
        chunks = chunks.len(),
        replaced = replaced_ids.len(),
        "compaction published"
    );

    Ok(CompactionOutcome {
        manifest: Some(published),
        chunks_rewritten: chunks.len(),
        partitions_removed: replaced_ids.len(),
        bytes_rewritten,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn partition(
        key: &str,
        start_offset_h: i64,
        size: i64,
        created_offset_s: i64,
    ) -> DatasetPartition {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        DatasetPartition {
            id: db_id(),
            dataset_id: db_id(),
            manifest_id: db_id(),
            partition_key: serde_json::json!({"key": key}),
            storage_target_id: db_id(),
            file_format: "jsonl".to_string(),
            file_path: format!("p-{start_offset_h}.jsonl"),
            file_size_bytes: Some(size),
            row_count: Some(1),
            start_time: base + Duration::hours(start_offset_h),
            end_time: base + Duration::hours(start_offset_h + 1),
            checksum: None,
            metadata: serde_json::json!({}),
            column_statistics: serde_json::json!({}),
            column_bloom_filters: serde_json::json!({}),
            ingestion_signature: Some(format!("sig-{start_offset_h}")),
            created_at: base + Duration::seconds(created_offset_s),
        }
    }

    #[test]
    fn chunks_respect_byte_budget_and_minimum_size() {
        let partitions = vec![
            partition("a", 0, 40, 0),
            partition("a", 1, 40, 1),
            partition("a", 2, 40, 2),
            partition("a", 3, 500, 3),
            partition("b", 0, 10, 4),
        ];
        let chunks = plan_chunks(&partitions, 100);
        // a: [0,1,2] fit in 100; [3] alone is not a chunk; b alone is not.
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].partition_ids.len(), 3);
    }

    #[test]
    fn single_partition_groups_are_left_alone() {
        let partitions = vec![partition("a", 0, 10, 0), partition("b", 0, 10, 1)];
        assert!(plan_chunks(&partitions, 100).is_empty());
    }

    #[test]
    fn merge_orders_by_time_and_prefers_newest_duplicate() {
        let old_rows = vec![
            serde_json::json!({"timestamp": "2024-01-01T02:00:00Z", "v": 1}),
            serde_json::json!({"timestamp": "2024-01-01T00:00:00Z", "v": 0}),
        ];
        let new_rows = vec![
            // Exact duplicate of a row in the older partition.
            serde_json::json!({"timestamp": "2024-01-01T02:00:00Z", "v": 1}),
            serde_json::json!({"timestamp": "2024-01-01T01:00:00Z", "v": 9}),
        ];
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let merged = merge_chunk_rows(
            "timestamp",
            vec![(t0, old_rows), (t0 + Duration::hours(1), new_rows)],
        );

        let times: Vec<&str> = merged
            .iter()
            .map(|r| r["timestamp"].as_str().unwrap())
            .collect();
        assert_eq!(
            times,
            vec![
                "2024-01-01T00:00:00Z",
                "2024-01-01T01:00:00Z",
                "2024-01-01T02:00:00Z"
            ]
        );
        // The duplicate collapsed to one copy.
        assert_eq!(merged.len(), 3);
    }
}
