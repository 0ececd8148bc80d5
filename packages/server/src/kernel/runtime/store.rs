//! Job metadata persistence.
//!
//! The runtime talks to definitions and runs through the `JobStore` trait;
//! production uses Postgres, tests substitute the in-memory double. Both
//! enforce the same transition guards: terminal run states are final.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::model::{merge_objects, JobDefinition, JobRun, NewJobDefinition, RunStatus};
use crate::common::error::{CoreError, CoreResult};
use crate::common::ids::db_id;
use crate::common::pagination::{trim_results, Cursor, Page};

/// Input for creating a run.
#[derive(Debug, Clone)]
pub struct NewJobRun {
    pub definition_id: Uuid,
    pub parameters: serde_json::Value,
    pub max_attempts: Option<i32>,
    pub context: serde_json::Value,
}

/// Terminal completion of a run.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub failure_reason: Option<String>,
    pub metrics_patch: serde_json::Value,
    pub context_patch: serde_json::Value,
}

impl RunCompletion {
    pub fn succeeded(run_id: Uuid, result: Option<serde_json::Value>) -> Self {
        Self {
            run_id,
            status: RunStatus::Succeeded,
            result,
            error_message: None,
            failure_reason: None,
            metrics_patch: serde_json::json!({}),
            context_patch: serde_json::json!({}),
        }
    }

    pub fn failed(run_id: Uuid, reason: &str, message: &str) -> Self {
        Self {
            run_id,
            status: RunStatus::Failed,
            result: None,
            error_message: Some(message.to_string()),
            failure_reason: Some(reason.to_string()),
            metrics_patch: serde_json::json!({}),
            context_patch: serde_json::json!({}),
        }
    }

    pub fn with_context(mut self, patch: serde_json::Value) -> Self {
        self.context_patch = patch;
        self
    }

    pub fn with_metrics(mut self, patch: serde_json::Value) -> Self {
        self.metrics_patch = patch;
        self
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Slug-keyed upsert; bumps `version` on every update.
    async fn upsert_definition(&self, input: NewJobDefinition) -> CoreResult<JobDefinition>;
    async fn definition_by_slug(&self, slug: &str) -> CoreResult<Option<JobDefinition>>;
    async fn definition_by_id(&self, id: Uuid) -> CoreResult<Option<JobDefinition>>;
    async fn list_definitions(
        &self,
        cursor: Option<Cursor>,
        limit: i64,
    ) -> CoreResult<Page<JobDefinition>>;

    async fn create_run(&self, input: NewJobRun) -> CoreResult<JobRun>;
    async fn run(&self, id: Uuid) -> CoreResult<Option<JobRun>>;
    async fn list_runs(&self, definition_id: Uuid, limit: i64) -> CoreResult<Vec<JobRun>>;

    /// Atomically transition `pending → running`. Returns `None` when the run
    /// is no longer pending (canceled, already picked up, terminal).
    async fn try_start_run(&self, id: Uuid) -> CoreResult<Option<JobRun>>;

    /// Complete a run with a terminal status. A run already terminal is left
    /// untouched and returned as-is.
    async fn complete_run(&self, completion: RunCompletion) -> CoreResult<JobRun>;

    /// Schedule another attempt: `running → pending` with `attempt + 1`.
    async fn requeue_run(&self, id: Uuid, failure_reason: &str, delay: Duration)
        -> CoreResult<JobRun>;

    /// Record liveness and optionally merge a context patch.
    async fn heartbeat_run(&self, id: Uuid, context_patch: Option<serde_json::Value>)
        -> CoreResult<()>;

    /// Cancel a pending or running run. Returns the updated run, or `None`
    /// when the run was already terminal.
    async fn cancel_run(&self, id: Uuid, reason: &str) -> CoreResult<Option<JobRun>>;
}

// ============================================================================
// Postgres
// ============================================================================

const DEFINITION_SELECT: &str = r#"
    SELECT id, slug, name, job_type, runtime, entry_point, timeout_ms,
           retry_policy, parameters_schema, default_parameters, output_schema,
           metadata, version, created_at, updated_at
    FROM job_definitions
"#;

const RUN_COLUMNS: &str = r#"id, job_definition_id, status, attempt, max_attempts, parameters,
           result, error_message, logs_url, metrics, context, scheduled_at,
           started_at, completed_at, last_heartbeat_at, retry_count,
           failure_reason, created_at, updated_at"#;

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn upsert_definition(&self, input: NewJobDefinition) -> CoreResult<JobDefinition> {
        let retry_policy = input
            .retry_policy
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let row = sqlx::query_as::<_, JobDefinition>(
            r#"
            INSERT INTO job_definitions (
                id, slug, name, job_type, runtime, entry_point, timeout_ms,
                retry_policy, parameters_schema, default_parameters,
                output_schema, metadata, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 1)
            ON CONFLICT (slug) DO UPDATE SET
                name = EXCLUDED.name,
                job_type = EXCLUDED.job_type,
                runtime = EXCLUDED.runtime,
                entry_point = EXCLUDED.entry_point,
                timeout_ms = EXCLUDED.timeout_ms,
                retry_policy = EXCLUDED.retry_policy,
                parameters_schema = EXCLUDED.parameters_schema,
                default_parameters = EXCLUDED.default_parameters,
                output_schema = EXCLUDED.output_schema,
                metadata = EXCLUDED.metadata,
                version = job_definitions.version + 1,
                updated_at = NOW()
            RETURNING id, slug, name, job_type, runtime, entry_point,
                      timeout_ms, retry_policy, parameters_schema,
                      default_parameters, output_schema, metadata, version,
                      created_at, updated_at
            "#,
        )
        .bind(db_id())
        .bind(&input.slug)
        .bind(&input.name)
        .bind(input.job_type.as_str())
        .bind(input.runtime.as_str())
        .bind(&input.entry_point)
        .bind(input.timeout_ms)
        .bind(retry_policy)
        .bind(&input.parameters_schema)
        .bind(&input.default_parameters)
        .bind(&input.output_schema)
        .bind(&input.metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn definition_by_slug(&self, slug: &str) -> CoreResult<Option<JobDefinition>> {
        let row = sqlx::query_as::<_, JobDefinition>(&format!(
            "{DEFINITION_SELECT} WHERE slug = $1"
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn definition_by_id(&self, id: Uuid) -> CoreResult<Option<JobDefinition>> {
        let row = sqlx::query_as::<_, JobDefinition>(&format!(
            "{DEFINITION_SELECT} WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_definitions(
        &self,
        cursor: Option<Cursor>,
        limit: i64,
    ) -> CoreResult<Page<JobDefinition>> {
        let rows = match &cursor {
            Some(c) => {
                sqlx::query_as::<_, JobDefinition>(&format!(
                    r#"{DEFINITION_SELECT}
                    WHERE (updated_at, id) < ($1, $2)
                    ORDER BY updated_at DESC, id DESC
                    LIMIT $3"#
                ))
                .bind(c.updated_at)
                .bind(c.id)
                .bind(limit + 1)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobDefinition>(&format!(
                    "{DEFINITION_SELECT} ORDER BY updated_at DESC, id DESC LIMIT $1"
                ))
                .bind(limit + 1)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let (items, has_more) = trim_results(rows, limit);
        let next_cursor = if has_more {
            items
                .last()
                .map(|d| Cursor::new(d.updated_at, d.id).encode())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn create_run(&self, input: NewJobRun) -> CoreResult<JobRun> {
        let row = sqlx::query_as::<_, JobRun>(&format!(
            r#"
            INSERT INTO job_runs (
                id, job_definition_id, status, attempt, max_attempts,
                parameters, metrics, context, scheduled_at
            )
            VALUES ($1, $2, 'pending', 1, $3, $4, '{{}}'::jsonb, $5, NOW())
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(db_id())
        .bind(input.definition_id)
        .bind(input.max_attempts)
        .bind(&input.parameters)
        .bind(&input.context)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn run(&self, id: Uuid) -> CoreResult<Option<JobRun>> {
        let row = sqlx::query_as::<_, JobRun>(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_runs(&self, definition_id: Uuid, limit: i64) -> CoreResult<Vec<JobRun>> {
        let rows = sqlx::query_as::<_, JobRun>(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM job_runs
            WHERE job_definition_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(definition_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn try_start_run(&self, id: Uuid) -> CoreResult<Option<JobRun>> {
        let row = sqlx::query_as::<_, JobRun>(&format!(
            r#"
            UPDATE job_runs
            SET status = 'running', started_at = NOW(),
                last_heartbeat_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn complete_run(&self, completion: RunCompletion) -> CoreResult<JobRun> {
        if !completion.status.is_terminal() {
            return Err(CoreError::validation(
                "complete_run requires a terminal status",
            ));
        }
        let row = sqlx::query_as::<_, JobRun>(&format!(
            r#"
            UPDATE job_runs
            SET status = $2,
                result = $3,
                error_message = $4,
                failure_reason = $5,
                metrics = metrics || $6,
                context = context || $7,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(completion.run_id)
        .bind(completion.status)
        .bind(&completion.result)
        .bind(&completion.error_message)
        .bind(&completion.failure_reason)
        .bind(&completion.metrics_patch)
        .bind(&completion.context_patch)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(run) => Ok(run),
            // Already terminal: final states are final.
            None => self
                .run(completion.run_id)
                .await?
                .ok_or_else(|| CoreError::not_found("run not found")),
        }
    }

    async fn requeue_run(
        &self,
        id: Uuid,
        failure_reason: &str,
        delay: Duration,
    ) -> CoreResult<JobRun> {
        let row = sqlx::query_as::<_, JobRun>(&format!(
            r#"
            UPDATE job_runs
            SET status = 'pending',
                attempt = attempt + 1,
                retry_count = retry_count + 1,
                failure_reason = $2,
                scheduled_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(failure_reason)
        .bind((delay.as_millis() as i64).to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| CoreError::concurrent_update("run is not running"))
    }

    async fn heartbeat_run(
        &self,
        id: Uuid,
        context_patch: Option<serde_json::Value>,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE job_runs
            SET last_heartbeat_at = NOW(),
                context = context || $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(context_patch.unwrap_or_else(|| serde_json::json!({})))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_run(&self, id: Uuid, reason: &str) -> CoreResult<Option<JobRun>> {
        let row = sqlx::query_as::<_, JobRun>(&format!(
            r#"
            UPDATE job_runs
            SET status = 'canceled',
                error_message = $2,
                failure_reason = 'canceled',
                completed_at = NOW(),
                metrics = metrics || '{{"cancelledSteps": 1}}'::jsonb,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

// ============================================================================
// In-memory double
// ============================================================================

#[derive(Default)]
struct MemoryState {
    definitions: HashMap<Uuid, JobDefinition>,
    runs: HashMap<Uuid, JobRun>,
}

/// Test double with the Postgres store's semantics.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<MemoryState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Microsecond-truncated now, matching Postgres timestamp precision so
/// cursors round-trip identically against both stores.
fn mem_now() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    chrono::TimeZone::timestamp_micros(&Utc, now.timestamp_micros())
        .single()
        .unwrap_or(now)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn upsert_definition(&self, input: NewJobDefinition) -> CoreResult<JobDefinition> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let retry_policy = input
            .retry_policy
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let existing = state
            .definitions
            .values()
            .find(|d| d.slug == input.slug)
            .cloned();
        let now = mem_now();
        let definition = match existing {
            Some(mut def) => {
                def.name = input.name;
                def.job_type = input.job_type.as_str().to_string();
                def.runtime = input.runtime.as_str().to_string();
                def.entry_point = input.entry_point;
                def.timeout_ms = input.timeout_ms;
                def.retry_policy = retry_policy;
                def.parameters_schema = input.parameters_schema;
                def.default_parameters = input.default_parameters;
                def.output_schema = input.output_schema;
                def.metadata = input.metadata;
                def.version += 1;
                def.updated_at = now;
                def
            }
            None => JobDefinition {
                id: db_id(),
                slug: input.slug,
                name: input.name,
                job_type: input.job_type.as_str().to_string(),
                runtime: input.runtime.as_str().to_string(),
                entry_point: input.entry_point,
                timeout_ms: input.timeout_ms,
                retry_policy,
                parameters_schema: input.parameters_schema,
                default_parameters: input.default_parameters,
                output_schema: input.output_schema,
                metadata: input.metadata,
                version: 1,
                created_at: now,
                updated_at: now,
            },
        };
        state.definitions.insert(definition.id, definition.clone());
        Ok(definition)
    }

    async fn definition_by_slug(&self, slug: &str) -> CoreResult<Option<JobDefinition>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.definitions.values().find(|d| d.slug == slug).cloned())
    }

    async fn definition_by_id(&self, id: Uuid) -> CoreResult<Option<JobDefinition>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.definitions.get(&id).cloned())
    }

    async fn list_definitions(
        &self,
        cursor: Option<Cursor>,
        limit: i64,
    ) -> CoreResult<Page<JobDefinition>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut defs: Vec<JobDefinition> = state.definitions.values().cloned().collect();
        defs.sort_by(|a, b| (b.updated_at, b.id).cmp(&(a.updated_at, a.id)));
        if let Some(c) = cursor {
            defs.retain(|d| (d.updated_at, d.id) < (c.updated_at, c.id));
        }
        defs.truncate(limit as usize + 1);
        let (items, has_more) = trim_results(defs, limit);
        let next_cursor = if has_more {
            items
                .last()
                .map(|d| Cursor::new(d.updated_at, d.id).encode())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn create_run(&self, input: NewJobRun) -> CoreResult<JobRun> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = mem_now();
        let run = JobRun {
            id: db_id(),
            job_definition_id: input.definition_id,
            status: RunStatus::Pending,
            attempt: 1,
            max_attempts: input.max_attempts,
            parameters: input.parameters,
            result: None,
            error_message: None,
            logs_url: None,
            metrics: serde_json::json!({}),
            context: input.context,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
            retry_count: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn run(&self, id: Uuid) -> CoreResult<Option<JobRun>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.runs.get(&id).cloned())
    }

    async fn list_runs(&self, definition_id: Uuid, limit: i64) -> CoreResult<Vec<JobRun>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut runs: Vec<JobRun> = state
            .runs
            .values()
            .filter(|r| r.job_definition_id == definition_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn try_start_run(&self, id: Uuid) -> CoreResult<Option<JobRun>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(run) = state.runs.get_mut(&id) else {
            return Ok(None);
        };
        if run.status != RunStatus::Pending {
            return Ok(None);
        }
        run.status = RunStatus::Running;
        run.started_at = Some(mem_now());
        run.last_heartbeat_at = Some(mem_now());
        run.updated_at = mem_now();
        Ok(Some(run.clone()))
    }

    async fn complete_run(&self, completion: RunCompletion) -> CoreResult<JobRun> {
        if !completion.status.is_terminal() {
            return Err(CoreError::validation(
                "complete_run requires a terminal status",
            ));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let run = state
            .runs
            .get_mut(&completion.run_id)
            .ok_or_else(|| CoreError::not_found("run not found"))?;
        if run.status.is_terminal() {
            return Ok(run.clone());
        }
        run.status = completion.status;
        run.result = completion.result;
        run.error_message = completion.error_message;
        run.failure_reason = completion.failure_reason;
        run.metrics = merge_objects(&run.metrics, &completion.metrics_patch);
        run.context = merge_objects(&run.context, &completion.context_patch);
        run.completed_at = Some(mem_now());
        run.updated_at = mem_now();
        Ok(run.clone())
    }

    async fn requeue_run(
        &self,
        id: Uuid,
        failure_reason: &str,
        delay: Duration,
    ) -> CoreResult<JobRun> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let run = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("run not found"))?;
        if run.status != RunStatus::Running {
            return Err(CoreError::concurrent_update("run is not running"));
        }
        run.status = RunStatus::Pending;
        run.attempt += 1;
        run.retry_count += 1;
        run.failure_reason = Some(failure_reason.to_string());
        run.scheduled_at = mem_now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        run.updated_at = mem_now();
        Ok(run.clone())
    }

    async fn heartbeat_run(
        &self,
        id: Uuid,
        context_patch: Option<serde_json::Value>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(run) = state.runs.get_mut(&id) {
            if run.status == RunStatus::Running {
                run.last_heartbeat_at = Some(mem_now());
                if let Some(patch) = context_patch {
                    run.context = merge_objects(&run.context, &patch);
                }
                run.updated_at = mem_now();
            }
        }
        Ok(())
    }

    async fn cancel_run(&self, id: Uuid, reason: &str) -> CoreResult<Option<JobRun>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(run) = state.runs.get_mut(&id) else {
            return Ok(None);
        };
        if run.status.is_terminal() {
            return Ok(None);
        }
        run.status = RunStatus::Canceled;
        run.error_message = Some(reason.to_string());
        run.failure_reason = Some("canceled".to_string());
        run.metrics = merge_objects(&run.metrics, &serde_json::json!({"cancelledSteps": 1}));
        run.completed_at = Some(mem_now());
        run.updated_at = mem_now();
        Ok(Some(run.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::runtime::model::{JobType, RuntimeKind};

    fn definition_input(slug: &str) -> NewJobDefinition {
        NewJobDefinition::builder()
            .slug(slug)
            .name(slug)
            .job_type(JobType::Batch)
            .runtime(RuntimeKind::Inproc)
            .entry_point(format!("handlers.{slug}"))
            .build()
    }

    #[tokio::test]
    async fn upsert_bumps_version() {
        let store = InMemoryJobStore::new();
        let first = store.upsert_definition(definition_input("echo")).await.unwrap();
        assert_eq!(first.version, 1);
        let second = store.upsert_definition(definition_input("echo")).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn run_lifecycle_start_and_complete() {
        let store = InMemoryJobStore::new();
        let def = store.upsert_definition(definition_input("echo")).await.unwrap();
        let run = store
            .create_run(NewJobRun {
                definition_id: def.id,
                parameters: serde_json::json!({}),
                max_attempts: None,
                context: serde_json::json!({}),
            })
            .await
            .unwrap();

        let started = store.try_start_run(run.id).await.unwrap().unwrap();
        assert_eq!(started.status, RunStatus::Running);
        assert!(started.started_at.is_some());

        // Second start is a no-op.
        assert!(store.try_start_run(run.id).await.unwrap().is_none());

        let completed = store
            .complete_run(RunCompletion::succeeded(
                run.id,
                Some(serde_json::json!({"ok": true})),
            ))
            .await
            .unwrap();
        assert_eq!(completed.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn terminal_states_are_final() {
        let store = InMemoryJobStore::new();
        let def = store.upsert_definition(definition_input("echo")).await.unwrap();
        let run = store
            .create_run(NewJobRun {
                definition_id: def.id,
                parameters: serde_json::json!({}),
                max_attempts: None,
                context: serde_json::json!({}),
            })
            .await
            .unwrap();

        store.try_start_run(run.id).await.unwrap();
        store.cancel_run(run.id, "operator cancel").await.unwrap();

        // A late completion does not overwrite the cancel.
        let after = store
            .complete_run(RunCompletion::succeeded(run.id, None))
            .await
            .unwrap();
        assert_eq!(after.status, RunStatus::Canceled);
        assert_eq!(after.metrics["cancelledSteps"], 1);

        // Cancel of a terminal run reports None.
        assert!(store.cancel_run(run.id, "again").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeue_increments_attempt() {
        let store = InMemoryJobStore::new();
        let def = store.upsert_definition(definition_input("echo")).await.unwrap();
        let run = store
            .create_run(NewJobRun {
                definition_id: def.id,
                parameters: serde_json::json!({}),
                max_attempts: Some(3),
                context: serde_json::json!({}),
            })
            .await
            .unwrap();
        store.try_start_run(run.id).await.unwrap();

        let requeued = store
            .requeue_run(run.id, "execution", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(requeued.status, RunStatus::Pending);
        assert_eq!(requeued.attempt, 2);
        assert_eq!(requeued.retry_count, 1);
    }

    #[tokio::test]
    async fn list_definitions_paginates_with_cursor() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store
                .upsert_definition(definition_input(&format!("job-{i}")))
                .await
                .unwrap();
        }
        let first = store.list_definitions(None, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = Cursor::decode(first.next_cursor.as_deref().unwrap()).unwrap();
        let second = store.list_definitions(Some(cursor), 2).await.unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(second.items[0].id != first.items[0].id);
    }
}
