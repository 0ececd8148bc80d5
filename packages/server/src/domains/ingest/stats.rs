//! Column statistics computed at ingestion time.
//!
//! Per column: value/null counts, type-appropriate min/max, and a distinct
//! count that goes exact-to-a-cap. The planner consults these for comparison
//! predicates the same way it consults bloom filters for equality.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::domains::datasets::schema::{FieldType, SchemaDef};

const DISTINCT_CAP: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ColumnStats {
    #[serde(rename = "type")]
    pub column_type: Option<FieldType>,
    pub null_count: i64,
    pub value_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<serde_json::Value>,
    /// Exact while distinct values stay under the cap; `None` past it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct_count: Option<i64>,
}

impl ColumnStats {
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// JSON value ordering within one column type.
fn less_than(field_type: FieldType, a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match field_type {
        FieldType::Integer => a.as_i64().unwrap_or(i64::MAX) < b.as_i64().unwrap_or(i64::MAX),
        FieldType::Double => {
            a.as_f64().unwrap_or(f64::INFINITY) < b.as_f64().unwrap_or(f64::INFINITY)
        }
        // RFC 3339 strings with a fixed offset compare correctly as strings
        // within one dataset; fall back to string order.
        FieldType::Timestamp | FieldType::String => {
            a.as_str().unwrap_or_default() < b.as_str().unwrap_or_default()
        }
        FieldType::Boolean => !a.as_bool().unwrap_or(true) & b.as_bool().unwrap_or(false),
    }
}

/// Compute per-column statistics for a row batch.
pub fn compute_column_stats(
    schema: &SchemaDef,
    rows: &[serde_json::Value],
) -> serde_json::Map<String, serde_json::Value> {
    let mut out = serde_json::Map::new();
    for field in &schema.fields {
        let mut stats = ColumnStats {
            column_type: Some(field.field_type),
            ..Default::default()
        };
        let mut distinct: Option<HashSet<String>> = Some(HashSet::new());

        for row in rows {
            let value = row.get(&field.name).filter(|v| !v.is_null());
            match value {
                None => stats.null_count += 1,
                Some(value) => {
                    stats.value_count += 1;
                    match &stats.min {
                        Some(min) if !less_than(field.field_type, value, min) => {}
                        _ => stats.min = Some(value.clone()),
                    }
                    match &stats.max {
                        Some(max) if !less_than(field.field_type, max, value) => {}
                        _ => stats.max = Some(value.clone()),
                    }
                    if let Some(set) = distinct.as_mut() {
                        set.insert(value.to_string());
                        if set.len() > DISTINCT_CAP {
                            distinct = None;
                        }
                    }
                }
            }
        }

        stats.distinct_count = distinct.map(|set| set.len() as i64);
        if let Ok(value) = serde_json::to_value(&stats) {
            out.insert(field.name.clone(), value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::datasets::schema::FieldDef;

    fn schema() -> SchemaDef {
        SchemaDef {
            fields: vec![
                FieldDef {
                    name: "timestamp".to_string(),
                    field_type: FieldType::Timestamp,
                },
                FieldDef {
                    name: "v".to_string(),
                    field_type: FieldType::Double,
                },
                FieldDef {
                    name: "host".to_string(),
                    field_type: FieldType::String,
                },
            ],
        }
    }

    #[test]
    fn min_max_and_null_counts() {
        let rows = vec![
            serde_json::json!({"timestamp": "2024-01-01T02:00:00Z", "v": 2.5, "host": "b"}),
            serde_json::json!({"timestamp": "2024-01-01T01:00:00Z", "v": -1.0, "host": "a"}),
            serde_json::json!({"timestamp": "2024-01-01T03:00:00Z", "host": "b"}),
        ];
        let stats = compute_column_stats(&schema(), &rows);

        let v = ColumnStats::from_value(&stats["v"]).unwrap();
        assert_eq!(v.null_count, 1);
        assert_eq!(v.value_count, 2);
        assert_eq!(v.min, Some(serde_json::json!(-1.0)));
        assert_eq!(v.max, Some(serde_json::json!(2.5)));

        let ts = ColumnStats::from_value(&stats["timestamp"]).unwrap();
        assert_eq!(ts.min, Some(serde_json::json!("2024-01-01T01:00:00Z")));
        assert_eq!(ts.max, Some(serde_json::json!("2024-01-01T03:00:00Z")));

        let host = ColumnStats::from_value(&stats["host"]).unwrap();
        assert_eq!(host.distinct_count, Some(2));
    }

    #[test]
    fn distinct_count_caps_out() {
        let rows: Vec<serde_json::Value> = (0..2000)
            .map(|i| serde_json::json!({"host": format!("h{i}")}))
            .collect();
        let schema = SchemaDef {
            fields: vec![FieldDef {
                name: "host".to_string(),
                field_type: FieldType::String,
            }],
        };
        let stats = compute_column_stats(&schema, &rows);
        let host = ColumnStats::from_value(&stats["host"]).unwrap();
        assert_eq!(host.distinct_count, None);
        assert_eq!(host.value_count, 2000);
    }
}
