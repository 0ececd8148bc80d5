//! Dataset field schemas and evolution rules.
//!
//! Schema versions are immutable. Without human review, the only accepted
//! evolutions are adding a nullable field and widening `integer → double`;
//! everything else is `schema-incompatible`.

use serde::{Deserialize, Serialize};

use crate::common::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Timestamp,
    String,
    Double,
    Integer,
    Boolean,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Timestamp => "timestamp",
            FieldType::String => "string",
            FieldType::Double => "double",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
        }
    }

    /// Numeric widening allowed without review.
    pub fn widens_to(self, other: FieldType) -> bool {
        self == FieldType::Integer && other == FieldType::Double
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// An ordered field list; the shape of one schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SchemaDef {
    pub fields: Vec<FieldDef>,
}

/// Outcome of comparing an incoming schema against the current version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaCompatibility {
    /// Same fields, same types.
    Identical,
    /// Additive: new nullable fields and/or integer→double widenings. The
    /// incoming schema becomes the next version.
    Additive,
    /// Requires an explicit new schema version and review.
    Incompatible(Vec<String>),
}

impl SchemaDef {
    pub fn from_value(value: &serde_json::Value) -> CoreResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| CoreError::validation(format!("invalid schema: {e}")))
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({"fields": []}))
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Compare `incoming` against `self` (the current version).
    pub fn compatibility(&self, incoming: &SchemaDef) -> SchemaCompatibility {
        let mut problems = Vec::new();
        let mut additive = false;

        for current in &self.fields {
            match incoming.field(&current.name) {
                None => problems.push(format!("field {} was removed", current.name)),
                Some(new) if new.field_type == current.field_type => {}
                Some(new) if current.field_type.widens_to(new.field_type) => {
                    additive = true;
                }
                Some(new) => problems.push(format!(
                    "field {} changed {} -> {}",
                    current.name,
                    current.field_type.as_str(),
                    new.field_type.as_str()
                )),
            }
        }

        for new in &incoming.fields {
            if self.field(&new.name).is_none() {
                // New fields are nullable by construction: existing rows
                // simply lack them.
                additive = true;
            }
        }

        if !problems.is_empty() {
            SchemaCompatibility::Incompatible(problems)
        } else if additive {
            SchemaCompatibility::Additive
        } else {
            SchemaCompatibility::Identical
        }
    }

    /// Validate one row against the schema. Unknown keys are rejected;
    /// missing fields read as null.
    pub fn validate_row(&self, row: &serde_json::Value) -> CoreResult<()> {
        let obj = row
            .as_object()
            .ok_or_else(|| CoreError::validation("row must be an object"))?;

        for key in obj.keys() {
            if self.field(key).is_none() {
                return Err(CoreError::validation(format!("unknown field {key}"))
                    .with_property("field", serde_json::json!(key)));
            }
        }

        for field in &self.fields {
            let Some(value) = obj.get(&field.name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let ok = match field.field_type {
                FieldType::Timestamp => value
                    .as_str()
                    .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
                    .unwrap_or(false),
                FieldType::String => value.is_string(),
                FieldType::Double => value.is_f64() || value.is_i64() || value.is_u64(),
                FieldType::Integer => value.is_i64() || value.is_u64(),
                FieldType::Boolean => value.is_boolean(),
            };
            if !ok {
                return Err(CoreError::validation(format!(
                    "field {} is not a {}",
                    field.name,
                    field.field_type.as_str()
                ))
                .with_property("field", serde_json::json!(field.name)));
            }
        }
        Ok(())
    }
}

/// The error ingestion surfaces for non-additive differences.
pub fn schema_incompatible(problems: Vec<String>) -> CoreError {
    CoreError::validation("schema incompatible with current version")
        .with_property("code", serde_json::json!("schema-incompatible"))
        .with_property("problems", serde_json::json!(problems))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(fields: &[(&str, FieldType)]) -> SchemaDef {
        SchemaDef {
            fields: fields
                .iter()
                .map(|(name, t)| FieldDef {
                    name: name.to_string(),
                    field_type: *t,
                })
                .collect(),
        }
    }

    #[test]
    fn identical_schemas() {
        let a = schema(&[("timestamp", FieldType::Timestamp), ("v", FieldType::Double)]);
        assert_eq!(a.compatibility(&a.clone()), SchemaCompatibility::Identical);
    }

    #[test]
    fn adding_a_field_is_additive() {
        let current = schema(&[("timestamp", FieldType::Timestamp)]);
        let incoming = schema(&[
            ("timestamp", FieldType::Timestamp),
            ("region", FieldType::String),
        ]);
        assert_eq!(
            current.compatibility(&incoming),
            SchemaCompatibility::Additive
        );
    }

    #[test]
    fn widening_integer_to_double_is_additive() {
        let current = schema(&[("count", FieldType::Integer)]);
        let incoming = schema(&[("count", FieldType::Double)]);
        assert_eq!(
            current.compatibility(&incoming),
            SchemaCompatibility::Additive
        );
    }

    #[test]
    fn narrowing_and_removal_are_incompatible() {
        let current = schema(&[("v", FieldType::Double), ("tag", FieldType::String)]);

        let narrowed = schema(&[("v", FieldType::Integer), ("tag", FieldType::String)]);
        assert!(matches!(
            current.compatibility(&narrowed),
            SchemaCompatibility::Incompatible(_)
        ));

        let removed = schema(&[("v", FieldType::Double)]);
        assert!(matches!(
            current.compatibility(&removed),
            SchemaCompatibility::Incompatible(_)
        ));

        let retyped = schema(&[("v", FieldType::Boolean), ("tag", FieldType::String)]);
        match current.compatibility(&retyped) {
            SchemaCompatibility::Incompatible(problems) => {
                assert!(problems[0].contains("double -> boolean"));
            }
            other => panic!("expected incompatible, got {other:?}"),
        }
    }

    #[test]
    fn row_validation_checks_types() {
        let s = schema(&[
            ("timestamp", FieldType::Timestamp),
            ("v", FieldType::Double),
            ("n", FieldType::Integer),
            ("ok", FieldType::Boolean),
        ]);

        s.validate_row(&serde_json::json!({
            "timestamp": "2024-01-01T00:00:00Z",
            "v": 1.5,
            "n": 3,
            "ok": true,
        }))
        .unwrap();

        // Integers are acceptable doubles.
        s.validate_row(&serde_json::json!({"v": 2})).unwrap();
        // Missing fields read as null.
        s.validate_row(&serde_json::json!({})).unwrap();

        assert!(s.validate_row(&serde_json::json!({"v": "nope"})).is_err());
        assert!(s.validate_row(&serde_json::json!({"n": 1.5})).is_err());
        assert!(s
            .validate_row(&serde_json::json!({"timestamp": "not-a-time"}))
            .is_err());
        assert!(s.validate_row(&serde_json::json!({"ghost": 1})).is_err());
        assert!(s.validate_row(&serde_json::json!([1, 2])).is_err());
    }
}
