//! Query planning: partition pruning.
//!
//! Three pruning passes over the published partition set: time-range
//! overlap, partition-key predicates, and column statistics (min/max for
//! comparisons, bloom filters for equality). Pruning is conservative:
//! anything uncertain survives to execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domains::datasets::DatasetPartition;
use crate::domains::ingest::{BloomFilter, ColumnStats, TimeRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    In,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<serde_json::Value>,
}

impl Filter {
    fn candidates(&self) -> Vec<&serde_json::Value> {
        match self.op {
            FilterOp::In => self.values.iter().collect(),
            _ => self.value.iter().collect(),
        }
    }
}

fn json_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (serde_json::Value::Number(x), serde_json::Value::Number(y)) => {
            x.as_f64().partial_cmp(&y.as_f64())
        }
        (serde_json::Value::String(x), serde_json::Value::String(y)) => Some(x.cmp(y)),
        (serde_json::Value::Bool(x), serde_json::Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Evaluate a filter against a concrete value (used for partition keys and
/// row filtering).
pub fn filter_matches(filter: &Filter, value: Option<&serde_json::Value>) -> bool {
    let Some(value) = value else {
        // Absent values only fail equality-style predicates.
        return matches!(filter.op, FilterOp::Ne);
    };
    match filter.op {
        FilterOp::Eq => filter.value.as_ref() == Some(value),
        FilterOp::Ne => filter.value.as_ref() != Some(value),
        FilterOp::In => filter.values.iter().any(|v| v == value),
        FilterOp::Lt | FilterOp::Lte | FilterOp::Gt | FilterOp::Gte => {
            let Some(bound) = filter.value.as_ref() else {
                return true;
            };
            match json_cmp(value, bound) {
                Some(ordering) => match filter.op {
                    FilterOp::Lt => ordering.is_lt(),
                    FilterOp::Lte => ordering.is_le(),
                    FilterOp::Gt => ordering.is_gt(),
                    FilterOp::Gte => ordering.is_ge(),
                    _ => unreachable!(),
                },
                // Mixed types: do not filter.
                None => true,
            }
        }
    }
}

/// Whether a partition may contain rows matching the filter, judged by its
/// recorded column statistics and bloom filters.
fn partition_may_match(partition: &DatasetPartition, filter: &Filter) -> bool {
    // Partition-key predicates are exact.
    if let Some(key_value) = partition.partition_key.get(&filter.column) {
        return filter_matches(filter, Some(key_value));
    }

    let stats = partition
        .column_statistics
        .get(&filter.column)
        .and_then(ColumnStats::from_value);

    if let Some(stats) = &stats {
        if let (Some(min), Some(max)) = (&stats.min, &stats.max) {
            let survives_stats = match filter.op {
                FilterOp::Eq | FilterOp::In => filter.candidates().iter().any(|candidate| {
                    json_cmp(candidate, min).map(|o| o.is_ge()).unwrap_or(true)
                        && json_cmp(candidate, max).map(|o| o.is_le()).unwrap_or(true)
                }),
                FilterOp::Lt => filter
                    .value
                    .as_ref()
                    .and_then(|bound| json_cmp(min, bound))
                    .map(|o| o.is_lt())
                    .unwrap_or(true),
                FilterOp::Lte => filter
                    .value
                    .as_ref()
                    .and_then(|bound| json_cmp(min, bound))
                    .map(|o| o.is_le())
                    .unwrap_or(true),
                FilterOp::Gt => filter
                    .value
                    .as_ref()
                    .and_then(|bound| json_cmp(max, bound))
                    .map(|o| o.is_gt())
                    .unwrap_or(true),
                FilterOp::Gte => filter
                    .value
                    .as_ref()
                    .and_then(|bound| json_cmp(max, bound))
                    .map(|o| o.is_ge())
                    .unwrap_or(true),
                FilterOp::Ne => true,
            };
            if !survives_stats {
                return false;
            }
        }
    }

    // Bloom filters prune equality candidates definitively.
    if matches!(filter.op, FilterOp::Eq | FilterOp::In) {
        if let Some(bloom) = partition
            .column_bloom_filters
            .get(&filter.column)
            .and_then(BloomFilter::from_value)
        {
            let any_possible = filter.candidates().iter().any(|candidate| {
                candidate
                    .as_str()
                    .map(|s| bloom.may_contain(s))
                    .unwrap_or(true)
            });
            if !any_possible {
                return false;
            }
        }
    }

    true
}

/// Partition survives when its time range overlaps the query window.
pub fn overlaps(partition: &DatasetPartition, range: &TimeRange) -> bool {
    partition.start_time <= range.end && partition.end_time >= range.start
}

/// The pruned plan: surviving partitions in time order.
pub struct QueryPlan<'a> {
    pub partitions: Vec<&'a DatasetPartition>,
    pub pruned_by_time: usize,
    pub pruned_by_predicates: usize,
}

pub fn plan<'a>(
    partitions: &'a [DatasetPartition],
    range: &TimeRange,
    filters: &[Filter],
) -> QueryPlan<'a> {
    let mut pruned_by_time = 0;
    let mut pruned_by_predicates = 0;
    let mut surviving = Vec::new();

    for partition in partitions {
        if !overlaps(partition, range) {
            pruned_by_time += 1;
            continue;
        }
        if filters
            .iter()
            .any(|filter| !partition_may_match(partition, filter))
        {
            pruned_by_predicates += 1;
            continue;
        }
        surviving.push(partition);
    }
    surviving.sort_by_key(|p| (p.start_time, p.id));

    QueryPlan {
        partitions: surviving,
        pruned_by_time,
        pruned_by_predicates,
    }
}

/// Row-level re-check applied after partition files are read.
pub fn row_matches(
    row: &serde_json::Value,
    timestamp_column: &str,
    range: &TimeRange,
    filters: &[Filter],
) -> bool {
    let ts = row
        .get(timestamp_column)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));
    match ts {
        Some(ts) if ts >= range.start && ts <= range.end => {}
        _ => return false,
    }
    filters
        .iter()
        .all(|filter| filter_matches(filter, row.get(&filter.column)))
}
