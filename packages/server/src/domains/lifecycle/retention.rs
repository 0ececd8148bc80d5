//! Retention.
//!
//! Time rule: partitions whose `endTime` predates `now − maxAgeHours −
//! deleteGraceMinutes` are dropped. Size rule: oldest partitions are evicted
//! until the total is back under `maxTotalBytes`. The surviving set is
//! republished before any file is physically deleted.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::metrics::LifecycleMetrics;
use crate::common::error::CoreResult;
use crate::domains::audit;
use crate::domains::datasets::{
    Dataset, DatasetManifest, DatasetPartition, ManifestEngine, PublishManifest, RetentionPolicy,
    RetentionRules,
};
use crate::kernel::metrics::Metrics;
use crate::kernel::storage::StorageDriver;

/// Partition ids selected for eviction.
pub fn select_evictions(
    partitions: &[DatasetPartition],
    rules: &RetentionRules,
    delete_grace_minutes: i32,
    now: DateTime<Utc>,
) -> Vec<Uuid> {
    let mut evicted: std::collections::HashSet<Uuid> = std::collections::HashSet::new();

    if let Some(max_age_hours) = rules.max_age_hours {
        let cutoff = now - Duration::hours(max_age_hours) - Duration::minutes(delete_grace_minutes as i64);
        for partition in partitions {
            if partition.end_time < cutoff {
                evicted.insert(partition.id);
            }
        }
    }

    if let Some(max_total_bytes) = rules.max_total_bytes {
        let mut remaining: Vec<&DatasetPartition> = partitions
            .iter()
            .filter(|p| !evicted.contains(&p.id))
            .collect();
        remaining.sort_by_key(|p| (p.end_time, p.id));
        let mut total: i64 = remaining
            .iter()
            .map(|p| p.file_size_bytes.unwrap_or(0))
            .sum();
        let mut index = 0;
        while total > max_total_bytes && index < remaining.len() {
            let oldest = remaining[index];
            evicted.insert(oldest.id);
            total -= oldest.file_size_bytes.unwrap_or(0);
            index += 1;
        }
    }

    // Stable order for auditability.
    let mut out: Vec<Uuid> = partitions
        .iter()
        .filter(|p| evicted.contains(&p.id))
        .map(|p| p.id)
        .collect();
    out.sort();
    out
}

pub struct RetentionOutcome {
    pub manifest: Option<DatasetManifest>,
    pub partitions_dropped: usize,
    pub bytes_dropped: i64,
}

/// Run retention for one `(dataset, shard)` lane.
#[allow(clippy::too_many_arguments)]
pub async fn run_retention(
    dataset: &Dataset,
    manifest: &DatasetManifest,
    partitions: &[DatasetPartition],
    policy: &RetentionPolicy,
    engine: &ManifestEngine,
    storage: &Arc<dyn StorageDriver>,
    lifecycle_metrics: &LifecycleMetrics,
    kernel_metrics: &Metrics,
) -> CoreResult<RetentionOutcome> {
    let rules = policy.parsed_rules();
    let evicted_ids = select_evictions(partitions, &rules, policy.delete_grace_minutes, Utc::now());
    if evicted_ids.is_empty() {
        return Ok(RetentionOutcome {
            manifest: None,
            partitions_dropped: 0,
            bytes_dropped: 0,
        });
    }

    let evicted: Vec<&DatasetPartition> = partitions
        .iter()
        .filter(|p| evicted_ids.contains(&p.id))
        .collect();
    let survivors: Vec<Uuid> = partitions
        .iter()
        .filter(|p| !evicted_ids.contains(&p.id))
        .map(|p| p.id)
        .collect();
    let bytes_dropped: i64 = evicted.iter().map(|p| p.file_size_bytes.unwrap_or(0)).sum();

    let published = engine
        .publish(PublishManifest {
            dataset_id: dataset.id,
            manifest_shard: manifest.manifest_shard.clone(),
            schema_version_id: manifest.schema_version_id,
            partitions: Vec::new(),
            summary: serde_json::json!({
                "retention": {
                    "dropped": evicted.len(),
                    "bytes": bytes_dropped,
                }
            }),
            created_by: Some("lifecycle:retention".to_string()),
            carry_over_partition_ids: survivors,
        })
        .await?;

    // Files go only after the survivor manifest is published.
    for partition in &evicted {
        if let Err(e) = storage.delete(&partition.file_path).await {
            warn!(path = %partition.file_path, error = %e, "retention file delete failed");
        }
        audit::record_lifecycle_event(
            engine.pool(),
            kernel_metrics,
            dataset.id,
            Some(published.id),
            "retention.drop",
            serde_json::json!({
                "partitionId": partition.id,
                "filePath": partition.file_path,
                "endTime": partition.end_time,
                "bytes": partition.file_size_bytes,
            }),
        )
        .await;
    }

    lifecycle_metrics.record_operation("retention", evicted.len() as i64, bytes_dropped);
    info!(
        dataset = %dataset.slug,
        shard = %manifest.manifest_shard,
        dropped = evicted.len(),
        "retention published"
    );

    Ok(RetentionOutcome {
        manifest: Some(published),
        partitions_dropped: evicted.len(),
        bytes_dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::db_id;
    use chrono::TimeZone;

    fn partition(end_offset_hours: i64, size: i64) -> DatasetPartition {
        let base = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        DatasetPartition {
            id: db_id(),
            dataset_id: db_id(),
            manifest_id: db_id(),
            partition_key: serde_json::json!({}),
            storage_target_id: db_id(),
            file_format: "jsonl".to_string(),
            file_path: format!("p{end_offset_hours}.jsonl"),
            file_size_bytes: Some(size),
            row_count: Some(1),
            start_time: base + Duration::hours(end_offset_hours - 1),
            end_time: base + Duration::hours(end_offset_hours),
            checksum: None,
            metadata: serde_json::json!({}),
            column_statistics: serde_json::json!({}),
            column_bloom_filters: serde_json::json!({}),
            ingestion_signature: None,
            created_at: base,
        }
    }

    #[test]
    fn time_rule_honors_age_and_grace() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let parts = vec![partition(0, 10), partition(10, 10), partition(12, 10)];
        let rules = RetentionRules {
            max_age_hours: Some(1),
            max_total_bytes: None,
        };

        // Cutoff with zero grace: now - 1h = 11:00. Partitions ending at
        // 00:00 and 10:00 are older; 12:00 survives.
        let evicted = select_evictions(&parts, &rules, 0, now);
        assert_eq!(evicted.len(), 2);

        // A two-hour grace pulls the cutoff to 09:00: only 00:00 goes.
        let evicted = select_evictions(&parts, &rules, 120, now);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0], parts[0].id);
    }

    #[test]
    fn size_rule_evicts_oldest_until_under_budget() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let parts = vec![partition(1, 100), partition(2, 100), partition(3, 100)];
        let rules = RetentionRules {
            max_age_hours: None,
            max_total_bytes: Some(150),
        };
        let evicted = select_evictions(&parts, &rules, 0, now);
        // 300 bytes total; dropping the two oldest gets to 100.
        assert_eq!(evicted.len(), 2);
        assert!(evicted.contains(&parts[0].id));
        assert!(evicted.contains(&parts[1].id));
    }

    #[test]
    fn hybrid_rules_combine() {
        let now = Utc.with_ymd_and_hms(2024, 1, 12, 0, 0, 0).unwrap();
        let parts = vec![partition(0, 10), partition(46, 200), partition(47, 200)];
        let rules = RetentionRules {
            max_age_hours: Some(24),
            max_total_bytes: Some(250),
        };
        let evicted = select_evictions(&parts, &rules, 0, now);
        // First goes by age (ends 2024-01-10T00:00, older than 24h);
        // then the size rule drops the older of the two survivors.
        assert_eq!(evicted.len(), 2);
        assert!(evicted.contains(&parts[0].id));
        assert!(evicted.contains(&parts[1].id));
    }

    #[test]
    fn empty_rules_keep_everything() {
        let now = Utc::now();
        let parts = vec![partition(0, 10)];
        let evicted = select_evictions(&parts, &RetentionRules::default(), 0, now);
        assert!(evicted.is_empty());
    }
}
