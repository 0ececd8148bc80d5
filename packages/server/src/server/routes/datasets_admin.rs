//! Admin dataset endpoints.

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::common::auth::AuthContext;
use crate::common::error::CoreError;
use crate::common::pagination::{clamp_limit, Cursor, Page};
use crate::domains::audit;
use crate::domains::datasets::{
    Dataset, DatasetManifest, DatasetStatus, RetentionPolicy, RetentionRules,
};
use crate::server::app::AppState;
use crate::server::error::ApiResult;

#[derive(Debug, Deserialize, Default)]
pub struct ListParams {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Page<Dataset>>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    let cursor = params
        .cursor
        .as_deref()
        .map(Cursor::decode)
        .transpose()?;
    let page = Dataset::list(cursor, clamp_limit(params.limit), &state.pool).await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatasetBody {
    pub slug: String,
    pub name: String,
    #[serde(default = "default_write_format")]
    pub write_format: String,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

fn default_write_format() -> String {
    "columnar".to_string()
}

fn empty_object() -> serde_json::Value {
    json!({})
}

pub async fn create_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateDatasetBody>,
) -> ApiResult<(StatusCode, Json<Dataset>)> {
    auth.require_scope(&state.scopes.admin_scope)?;
    if body.slug.is_empty()
        || !body
            .slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(CoreError::validation(
            "slug must be lowercase alphanumerics and dashes",
        )
        .into());
    }
    let dataset = Dataset::create(
        &body.slug,
        &body.name,
        &body.write_format,
        None,
        body.metadata,
        &state.pool,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(dataset)))
}

pub async fn get_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Dataset>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    let dataset = Dataset::find_by_id(id, &state.pool)
        .await?
        .ok_or_else(|| CoreError::not_found("dataset not found"))?;
    Ok(Json(dataset))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchDatasetBody {
    /// Optimistic concurrency token: the `updatedAt` the caller last saw.
    pub if_match: DateTime<Utc>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<DatasetStatus>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

pub async fn patch_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchDatasetBody>,
) -> ApiResult<Json<Dataset>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    let dataset = Dataset::update_with_if_match(
        id,
        body.if_match,
        body.name.as_deref(),
        body.status,
        body.metadata.as_ref(),
        &state.pool,
    )
    .await?;
    Ok(Json(dataset))
}

pub async fn archive_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Dataset>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    let dataset = Dataset::archive(id, &state.pool).await?;
    Ok(Json(dataset))
}

pub async fn manifests_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    let manifests = DatasetManifest::list_for_dataset(id, 100, &state.pool).await?;
    Ok(Json(json!({"manifests": manifests})))
}

pub async fn audit_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    let lifecycle = audit::lifecycle_entries(&state.pool, id, 100).await?;
    let access = audit::access_events(&state.pool, id, 100).await?;
    Ok(Json(json!({
        "lifecycle": lifecycle,
        "access": access,
    })))
}

pub async fn get_retention_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    let policy = RetentionPolicy::find(id, &state.pool).await?;
    Ok(Json(json!({"policy": policy})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutRetentionBody {
    #[serde(default = "default_mode")]
    pub mode: String,
    pub rules: RetentionRules,
    #[serde(default)]
    pub delete_grace_minutes: i32,
}

fn default_mode() -> String {
    "time".to_string()
}

pub async fn put_retention_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<PutRetentionBody>,
) -> ApiResult<Json<RetentionPolicy>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    if !matches!(body.mode.as_str(), "time" | "size" | "hybrid") {
        return Err(CoreError::validation("mode must be time, size, or hybrid").into());
    }
    Dataset::find_by_id(id, &state.pool)
        .await?
        .ok_or_else(|| CoreError::not_found("dataset not found"))?;
    let policy = RetentionPolicy::upsert(
        id,
        &body.mode,
        &body.rules,
        body.delete_grace_minutes,
        &state.pool,
    )
    .await?;
    Ok(Json(policy))
}
