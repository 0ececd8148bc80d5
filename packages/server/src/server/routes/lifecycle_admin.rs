//! Admin lifecycle endpoints.

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::common::auth::AuthContext;
use crate::common::error::CoreError;
use crate::domains::datasets::Dataset;
use crate::domains::lifecycle::{LifecycleJobRun, LifecycleOperation, TriggerSource};
use crate::server::app::AppState;
use crate::server::error::ApiResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLifecycleBody {
    #[serde(default)]
    pub dataset_id: Option<Uuid>,
    #[serde(default)]
    pub dataset_slug: Option<String>,
    pub operations: Vec<String>,
}

/// `POST /admin/lifecycle/run` — enqueue a maintenance job for one dataset.
pub async fn run_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<RunLifecycleBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    auth.require_scope(&state.scopes.admin_scope)?;

    let operations: Vec<LifecycleOperation> = body
        .operations
        .iter()
        .map(|name| LifecycleOperation::parse(name))
        .collect::<Result<_, _>>()?;
    if operations.is_empty() {
        return Err(CoreError::validation("operations must not be empty").into());
    }

    let dataset_id = match (body.dataset_id, &body.dataset_slug) {
        (Some(id), _) => id,
        (None, Some(slug)) => Dataset::require_by_slug(slug, &state.pool).await?.id,
        (None, None) => {
            return Err(
                CoreError::validation("datasetId or datasetSlug is required").into(),
            )
        }
    };

    let run = state
        .lifecycle
        .schedule_dataset(&state.queue, dataset_id, &operations, TriggerSource::Manual)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"lifecycleRunId": run.id, "status": run.status})),
    ))
}

/// `GET /admin/lifecycle/status` — metrics snapshot plus recent runs.
pub async fn status_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    let snapshot = state.lifecycle.metrics().snapshot();
    let recent = LifecycleJobRun::recent(50, &state.pool).await?;
    Ok(Json(json!({
        "metrics": snapshot,
        "recentRuns": recent,
    })))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleBody {
    #[serde(default)]
    pub dataset_id: Option<Uuid>,
}

/// `POST /admin/lifecycle/reschedule` — re-enqueue maintenance for one or
/// every active dataset.
pub async fn reschedule_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: Option<Json<RescheduleBody>>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    auth.require_scope(&state.scopes.admin_scope)?;

    let targets = match body.and_then(|Json(b)| b.dataset_id) {
        Some(dataset_id) => vec![dataset_id],
        None => Dataset::active_ids(&state.pool).await?,
    };

    let operations = [
        LifecycleOperation::Compaction,
        LifecycleOperation::Retention,
        LifecycleOperation::PostgresMigration,
    ];
    let mut scheduled = Vec::with_capacity(targets.len());
    for dataset_id in targets {
        let run = state
            .lifecycle
            .schedule_dataset(&state.queue, dataset_id, &operations, TriggerSource::Api)
            .await?;
        scheduled.push(run.id);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"scheduled": scheduled})),
    ))
}
