//! Downsampling: time-bucketed aggregation.
//!
//! A downsample request rewrites the query into `bucket, agg(col)…` grouped
//! by bucket. Supported aggregations: avg, min, max, sum, median, count,
//! count_distinct, percentile(p ∈ [0, 1]).

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::common::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFn {
    Avg,
    Min,
    Max,
    Sum,
    Median,
    Count,
    CountDistinct,
    Percentile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregation {
    pub column: String,
    #[serde(rename = "fn")]
    pub agg_fn: AggFn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Required for `percentile`; must be within `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentile: Option<f64>,
}

impl Aggregation {
    pub fn output_name(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        match self.agg_fn {
            AggFn::Percentile => format!(
                "p{}_{}",
                (self.percentile.unwrap_or(0.0) * 100.0).round() as i64,
                self.column
            ),
            AggFn::Avg => format!("avg_{}", self.column),
            AggFn::Min => format!("min_{}", self.column),
            AggFn::Max => format!("max_{}", self.column),
            AggFn::Sum => format!("sum_{}", self.column),
            AggFn::Median => format!("median_{}", self.column),
            AggFn::Count => format!("count_{}", self.column),
            AggFn::CountDistinct => format!("count_distinct_{}", self.column),
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        match self.agg_fn {
            AggFn::Percentile => match self.percentile {
                Some(p) if (0.0..=1.0).contains(&p) => Ok(()),
                _ => Err(CoreError::validation(format!(
                    "percentile for {} must be in [0, 1]",
                    self.column
                ))),
            },
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Downsample {
    pub interval_seconds: i64,
    pub aggregations: Vec<Aggregation>,
}

impl Downsample {
    pub fn validate(&self) -> CoreResult<()> {
        if self.interval_seconds <= 0 {
            return Err(CoreError::validation("intervalSeconds must be positive"));
        }
        if self.aggregations.is_empty() {
            return Err(CoreError::validation("aggregations must not be empty"));
        }
        for agg in &self.aggregations {
            agg.validate()?;
        }
        Ok(())
    }
}

fn bucket_start(ts: DateTime<Utc>, interval_seconds: i64) -> DateTime<Utc> {
    let epoch = ts.timestamp();
    let bucket = epoch.div_euclid(interval_seconds) * interval_seconds;
    Utc.timestamp_opt(bucket, 0).single().unwrap_or(ts)
}

fn percentile_of(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

/// Aggregate rows into time buckets. Rows without a parsable timestamp are
/// skipped.
pub fn downsample_rows(
    rows: &[serde_json::Value],
    timestamp_column: &str,
    spec: &Downsample,
) -> CoreResult<Vec<serde_json::Value>> {
    spec.validate()?;

    let mut buckets: BTreeMap<i64, Vec<&serde_json::Value>> = BTreeMap::new();
    for row in rows {
        let Some(ts) = row
            .get(timestamp_column)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        else {
            continue;
        };
        let bucket = bucket_start(ts.with_timezone(&Utc), spec.interval_seconds);
        buckets.entry(bucket.timestamp()).or_default().push(row);
    }

    let mut out = Vec::with_capacity(buckets.len());
    for (bucket_epoch, bucket_rows) in buckets {
        let bucket = Utc
            .timestamp_opt(bucket_epoch, 0)
            .single()
            .unwrap_or_default();
        let mut row = serde_json::Map::new();
        row.insert(
            "bucket".to_string(),
            serde_json::json!(bucket.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        );

        for agg in &spec.aggregations {
            let value = aggregate(agg, &bucket_rows);
            row.insert(agg.output_name(), value);
        }
        out.push(serde_json::Value::Object(row));
    }
    Ok(out)
}

fn aggregate(agg: &Aggregation, rows: &[&serde_json::Value]) -> serde_json::Value {
    match agg.agg_fn {
        AggFn::Count => {
            let count = rows
                .iter()
                .filter(|r| r.get(&agg.column).map(|v| !v.is_null()).unwrap_or(false))
                .count();
            serde_json::json!(count)
        }
        AggFn::CountDistinct => {
            let distinct: std::collections::HashSet<String> = rows
                .iter()
                .filter_map(|r| r.get(&agg.column))
                .filter(|v| !v.is_null())
                .map(|v| v.to_string())
                .collect();
            serde_json::json!(distinct.len())
        }
        _ => {
            let mut values: Vec<f64> = rows
                .iter()
                .filter_map(|r| r.get(&agg.column))
                .filter_map(|v| v.as_f64())
                .collect();
            if values.is_empty() {
                return serde_json::Value::Null;
            }
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let result = match agg.agg_fn {
                AggFn::Avg => values.iter().sum::<f64>() / values.len() as f64,
                AggFn::Min => values[0],
                AggFn::Max => values[values.len() - 1],
                AggFn::Sum => values.iter().sum(),
                AggFn::Median => percentile_of(&values, 0.5),
                AggFn::Percentile => percentile_of(&values, agg.percentile.unwrap_or(0.5)),
                _ => unreachable!(),
            };
            serde_json::json!(result)
        }
    }
}

/// Column names of the downsampled result set.
pub fn downsample_columns(spec: &Downsample) -> Vec<String> {
    let mut columns = vec!["bucket".to_string()];
    columns.extend(spec.aggregations.iter().map(|a| a.output_name()));
    columns
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<serde_json::Value> {
        vec![
            serde_json::json!({"timestamp": "2024-01-01T00:00:10Z", "v": 1.0, "host": "a"}),
            serde_json::json!({"timestamp": "2024-01-01T00:00:50Z", "v": 3.0, "host": "b"}),
            serde_json::json!({"timestamp": "2024-01-01T00:01:10Z", "v": 10.0, "host": "a"}),
            serde_json::json!({"timestamp": "2024-01-01T00:01:20Z", "v": 20.0, "host": "a"}),
        ]
    }

    fn spec(aggs: Vec<Aggregation>) -> Downsample {
        Downsample {
            interval_seconds: 60,
            aggregations: aggs,
        }
    }

    fn agg(column: &str, agg_fn: AggFn) -> Aggregation {
        Aggregation {
            column: column.to_string(),
            agg_fn,
            alias: None,
            percentile: None,
        }
    }

    #[test]
    fn buckets_by_interval_and_aggregates() {
        let spec = spec(vec![
            agg("v", AggFn::Avg),
            agg("v", AggFn::Sum),
            agg("host", AggFn::CountDistinct),
        ]);
        let out = downsample_rows(&rows(), "timestamp", &spec).unwrap();
        assert_eq!(out.len(), 2);

        assert_eq!(out[0]["bucket"], "2024-01-01T00:00:00Z");
        assert_eq!(out[0]["avg_v"], 2.0);
        assert_eq!(out[0]["sum_v"], 4.0);
        assert_eq!(out[0]["count_distinct_host"], 2);

        assert_eq!(out[1]["bucket"], "2024-01-01T00:01:00Z");
        assert_eq!(out[1]["avg_v"], 15.0);
    }

    #[test]
    fn median_and_percentile() {
        let rows = vec![
            serde_json::json!({"timestamp": "2024-01-01T00:00:01Z", "v": 1.0}),
            serde_json::json!({"timestamp": "2024-01-01T00:00:02Z", "v": 2.0}),
            serde_json::json!({"timestamp": "2024-01-01T00:00:03Z", "v": 3.0}),
            serde_json::json!({"timestamp": "2024-01-01T00:00:04Z", "v": 4.0}),
        ];
        let spec = spec(vec![
            agg("v", AggFn::Median),
            Aggregation {
                column: "v".to_string(),
                agg_fn: AggFn::Percentile,
                alias: None,
                percentile: Some(1.0),
            },
        ]);
        let out = downsample_rows(&rows, "timestamp", &spec).unwrap();
        assert_eq!(out[0]["median_v"], 2.5);
        assert_eq!(out[0]["p100_v"], 4.0);
    }

    #[test]
    fn percentile_requires_unit_interval() {
        let bad = Aggregation {
            column: "v".to_string(),
            agg_fn: AggFn::Percentile,
            alias: None,
            percentile: Some(1.5),
        };
        assert!(bad.validate().is_err());
        let missing = Aggregation {
            column: "v".to_string(),
            agg_fn: AggFn::Percentile,
            alias: None,
            percentile: None,
        };
        assert!(missing.validate().is_err());
    }

    #[test]
    fn empty_buckets_produce_null_aggregates() {
        let rows = vec![serde_json::json!({"timestamp": "2024-01-01T00:00:01Z"})];
        let spec = spec(vec![agg("v", AggFn::Avg), agg("v", AggFn::Count)]);
        let out = downsample_rows(&rows, "timestamp", &spec).unwrap();
        assert_eq!(out[0]["avg_v"], serde_json::Value::Null);
        assert_eq!(out[0]["count_v"], 0);
    }
}
