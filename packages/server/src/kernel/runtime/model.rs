//! Job definition and run models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Expired,
}

impl RunStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled | RunStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    #[default]
    Batch,
    ServiceTriggered,
    Manual,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Batch => "batch",
            JobType::ServiceTriggered => "service-triggered",
            JobType::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> CoreResult<Self> {
        match value {
            "batch" => Ok(JobType::Batch),
            "service-triggered" => Ok(JobType::ServiceTriggered),
            "manual" => Ok(JobType::Manual),
            other => Err(CoreError::validation(format!("unknown job type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    #[default]
    Inproc,
    Interpreter,
    Container,
    Module,
}

impl RuntimeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::Inproc => "inproc",
            RuntimeKind::Interpreter => "interpreter",
            RuntimeKind::Container => "container",
            RuntimeKind::Module => "module",
        }
    }

    pub fn parse(value: &str) -> CoreResult<Self> {
        match value {
            "inproc" => Ok(RuntimeKind::Inproc),
            "interpreter" => Ok(RuntimeKind::Interpreter),
            "container" => Ok(RuntimeKind::Container),
            "module" => Ok(RuntimeKind::Module),
            other => Err(CoreError::validation(format!("unknown runtime {other}"))),
        }
    }
}

// ============================================================================
// Retry policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RetryStrategy {
    #[default]
    None,
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub initial_delay_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<i32>,
    /// Jitter ratio in `[0, 1]` applied to the computed delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::None,
            initial_delay_ms: 1_000,
            max_delay_ms: None,
            max_attempts: None,
            jitter_ratio: 0.0,
        }
    }
}

// ============================================================================
// Job definition
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub job_type: String,
    pub runtime: String,
    pub entry_point: String,
    pub timeout_ms: Option<i64>,
    pub retry_policy: Option<serde_json::Value>,
    pub parameters_schema: serde_json::Value,
    pub default_parameters: serde_json::Value,
    pub output_schema: serde_json::Value,
    pub metadata: serde_json::Value,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    pub fn runtime_kind(&self) -> CoreResult<RuntimeKind> {
        RuntimeKind::parse(&self.runtime)
    }

    /// The parsed retry policy, or the default (`none`) when absent or
    /// malformed.
    pub fn parsed_retry_policy(&self) -> RetryPolicy {
        self.retry_policy
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Input for the slug-keyed upsert.
#[derive(Debug, Clone, TypedBuilder, Deserialize)]
#[builder(field_defaults(setter(into)))]
#[serde(rename_all = "camelCase")]
pub struct NewJobDefinition {
    pub slug: String,
    pub name: String,
    #[builder(default = JobType::Batch)]
    #[serde(default)]
    pub job_type: JobType,
    #[builder(default = RuntimeKind::Inproc)]
    #[serde(default)]
    pub runtime: RuntimeKind,
    pub entry_point: String,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub timeout_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[builder(default = serde_json::json!({}))]
    #[serde(default = "empty_object")]
    pub parameters_schema: serde_json::Value,
    #[builder(default = serde_json::json!({}))]
    #[serde(default = "empty_object")]
    pub default_parameters: serde_json::Value,
    #[builder(default = serde_json::json!({}))]
    #[serde(default = "empty_object")]
    pub output_schema: serde_json::Value,
    #[builder(default = serde_json::json!({}))]
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

// ============================================================================
// Job run
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub id: Uuid,
    pub job_definition_id: Uuid,
    pub status: RunStatus,
    pub attempt: i32,
    pub max_attempts: Option<i32>,
    pub parameters: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub logs_url: Option<String>,
    pub metrics: serde_json::Value,
    pub context: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRun {
    /// Effective parameters: submitted values override definition defaults,
    /// key by key at the top level.
    pub fn effective_parameters(&self, definition: &JobDefinition) -> serde_json::Value {
        merge_objects(&definition.default_parameters, &self.parameters)
    }

    /// Effective timeout: run context override wins over the definition.
    pub fn effective_timeout_ms(&self, definition: &JobDefinition) -> Option<i64> {
        self.context
            .get("timeoutMs")
            .and_then(|v| v.as_i64())
            .or(definition.timeout_ms)
    }
}

/// Shallow object merge; `overlay` keys win. Non-object inputs yield the
/// overlay unchanged.
pub fn merge_objects(base: &serde_json::Value, overlay: &serde_json::Value) -> serde_json::Value {
    match (base.as_object(), overlay.as_object()) {
        (Some(base), Some(overlay)) => {
            let mut merged = base.clone();
            for (k, v) in overlay {
                merged.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(RunStatus::Expired.is_terminal());
    }

    #[test]
    fn runtime_kind_round_trip() {
        for kind in [
            RuntimeKind::Inproc,
            RuntimeKind::Interpreter,
            RuntimeKind::Container,
            RuntimeKind::Module,
        ] {
            assert_eq!(RuntimeKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(RuntimeKind::parse("wasm").is_err());
    }

    #[test]
    fn merge_objects_overlay_wins() {
        let base = serde_json::json!({"a": 1, "b": 2});
        let overlay = serde_json::json!({"b": 3, "c": 4});
        assert_eq!(
            merge_objects(&base, &overlay),
            serde_json::json!({"a": 1, "b": 3, "c": 4})
        );
    }

    #[test]
    fn malformed_retry_policy_falls_back_to_none() {
        let definition = JobDefinition {
            id: Uuid::now_v7(),
            slug: "x".into(),
            name: "x".into(),
            job_type: "batch".into(),
            runtime: "inproc".into(),
            entry_point: "handlers.x".into(),
            timeout_ms: None,
            retry_policy: Some(serde_json::json!("not-a-policy")),
            parameters_schema: serde_json::json!({}),
            default_parameters: serde_json::json!({}),
            output_schema: serde_json::json!({}),
            metadata: serde_json::json!({}),
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(definition.parsed_retry_policy().strategy, RetryStrategy::None);
    }
}
