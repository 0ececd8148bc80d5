//! `POST /datasets/{slug}/query`.

use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::json;

use crate::common::auth::AuthContext;
use crate::domains::audit;
use crate::domains::datasets::Dataset;
use crate::domains::query::{QueryRequest, QueryResponse};
use crate::server::app::AppState;
use crate::server::error::ApiResult;
use crate::server::middleware::require_dataset_read;

pub async fn query_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(slug): Path<String>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    let dataset = Dataset::require_by_slug(&slug, &state.pool).await?;

    if let Err(err) = require_dataset_read(&auth, &dataset, &state.scopes.default_scope) {
        audit::record_access_event(
            &state.pool,
            &state.metrics,
            Some(dataset.id),
            &slug,
            auth.actor(),
            auth.scopes.iter().map(str::to_string).collect(),
            "query",
            false,
            json!({}),
        )
        .await;
        return Err(err.into());
    }

    let response = state.executor.query(&dataset, request).await?;

    audit::record_access_event(
        &state.pool,
        &state.metrics,
        Some(dataset.id),
        &slug,
        auth.actor(),
        auth.scopes.iter().map(str::to_string).collect(),
        "query",
        true,
        json!({"mode": response.mode}),
    )
    .await;

    Ok(Json(response))
}
