//! SQL endpoints: `/sql/read`, `/sql/exec`, `/sql/saved`.

use std::collections::HashMap;

use axum::extract::{Extension, Path};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::common::auth::AuthContext;
use crate::common::error::CoreError;
use crate::domains::datasets::Dataset;
use crate::domains::query::sql::relational_read;
use crate::domains::query::{
    collect_table_candidates, exec_statement, guard_read_statement, render_csv, render_text,
    rewrite_statement, ExecOutcome, SavedSqlQuery,
};
use crate::server::app::AppState;
use crate::server::error::{ApiError, ApiResult};
use crate::server::middleware::require_dataset_read;

const STATEMENT_TIMEOUT_HEADER: &str = "x-statement-timeout-seconds";

#[derive(Debug, Deserialize)]
pub struct SqlBody {
    pub sql: String,
}

fn response_columns(rows: &[serde_json::Value]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        if let Some(obj) = row.as_object() {
            for key in obj.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }
    columns
}

/// Read endpoint: one SELECT/WITH statement, dataset slugs rewritten to
/// backend tables, result streamed as JSON, CSV, or plain text per `Accept`.
pub async fn read_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    Json(body): Json<SqlBody>,
) -> Result<Response, ApiError> {
    let statement = guard_read_statement(&body.sql)?;

    // Resolve dataset-slug identifiers and enforce read scopes per dataset.
    let mut resolved = HashMap::new();
    for candidate in collect_table_candidates(&statement) {
        if let Some(qualified) = state.sql_cache.resolve(&candidate, &state.pool).await? {
            let dataset = Dataset::require_by_slug(&candidate, &state.pool).await?;
            require_dataset_read(&auth, &dataset, &state.scopes.default_scope)?;
            resolved.insert(candidate, qualified);
        }
    }
    let rewritten = rewrite_statement(&statement, &resolved)?;

    let timeout_seconds: Option<u32> = headers
        .get(STATEMENT_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    let (rows, truncated) = match &state.columnar {
        Some(driver) => (driver.query_json(&rewritten).await?, false),
        // No columnar backend configured: serve from the relational side
        // with the statement timeout applied.
        None => relational_read(&state.pool, &rewritten, timeout_seconds).await?,
    };

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");

    let columns = response_columns(&rows);
    let response = if accept.contains("text/csv") {
        (
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            render_csv(&columns, &rows),
        )
            .into_response()
    } else if accept.contains("text/plain") {
        (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            render_text(&columns, &rows),
        )
            .into_response()
    } else {
        Json(json!({
            "rows": rows,
            "columns": columns,
            "truncated": truncated,
        }))
        .into_response()
    };
    Ok(response)
}

/// Exec endpoint: arbitrary relational statement, separately authorized.
pub async fn exec_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<SqlBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    let outcome = exec_statement(&state.pool, &body.sql).await?;
    match outcome {
        ExecOutcome::Rows { rows, truncated } => Ok(Json(json!({
            "rows": rows,
            "columns": response_columns(&rows),
            "truncated": truncated,
        }))),
        ExecOutcome::Command { rows_affected } => {
            Ok(Json(json!({"rowsAffected": rows_affected})))
        }
    }
}

// ----------------------------------------------------------------------
// Saved queries
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedQueryBody {
    pub statement: String,
    #[serde(default)]
    pub label: Option<String>,
}

pub async fn list_saved_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_scope(&state.scopes.default_scope)?;
    let queries = SavedSqlQuery::list(&state.pool, 200).await?;
    Ok(Json(json!({"savedQueries": queries})))
}

pub async fn get_saved_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<SavedSqlQuery>> {
    auth.require_scope(&state.scopes.default_scope)?;
    let query = SavedSqlQuery::find(&id, &state.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("saved query {id} not found")))?;
    Ok(Json(query))
}

pub async fn put_saved_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<SavedQueryBody>,
) -> ApiResult<Json<SavedSqlQuery>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    // Saved statements must pass the same read guard they will run under.
    guard_read_statement(&body.statement)?;
    let saved = SavedSqlQuery::upsert(
        &id,
        body.label.as_deref(),
        &body.statement,
        auth.actor(),
        &state.pool,
    )
    .await?;
    Ok(Json(saved))
}

pub async fn delete_saved_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    auth.require_scope(&state.scopes.admin_scope)?;
    let deleted = SavedSqlQuery::delete(&id, &state.pool).await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CoreError::not_found(format!("saved query {id} not found")).into())
    }
}
