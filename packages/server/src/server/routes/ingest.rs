//! `POST /datasets/{slug}/ingest`.

use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::json;

use crate::common::auth::AuthContext;
use crate::domains::audit;
use crate::domains::datasets::Dataset;
use crate::domains::ingest::{IngestRequest, QueuedIngest};
use crate::kernel::queue::{names, EnqueueOptions};
use crate::server::app::AppState;
use crate::server::error::ApiResult;
use crate::server::middleware::require_dataset_write;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Inline mode runs the pipeline on this request and returns 201; queued
/// mode enqueues the full body and returns 202 with the job id.
pub async fn ingest_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    Json(mut request): Json<IngestRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    // Header idempotency key wins over the body field.
    if let Some(header_key) = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        request.idempotency_key = Some(header_key.to_string());
    }
    if request.actor.is_none() {
        request.actor = auth.actor().map(str::to_string);
    }

    // Existing datasets enforce their scope lists; first-time ingests fall
    // back to the global default write scope.
    let existing = Dataset::find_by_slug(&slug, &state.pool).await?;
    let authz = match &existing {
        Some(dataset) => require_dataset_write(&auth, dataset, &state.scopes.default_scope),
        None => auth.require_scope(&state.scopes.default_scope),
    };
    if let Err(err) = authz {
        audit::record_access_event(
            &state.pool,
            &state.metrics,
            existing.as_ref().map(|d| d.id),
            &slug,
            auth.actor(),
            auth.scopes.iter().map(str::to_string).collect(),
            "ingest",
            false,
            json!({}),
        )
        .await;
        return Err(err.into());
    }

    let queue_health = state.queue.health();
    if queue_health.inline {
        let outcome = state.pipeline.ingest(&slug, request).await?;
        audit::record_access_event(
            &state.pool,
            &state.metrics,
            Some(outcome.dataset_id),
            &slug,
            auth.actor(),
            auth.scopes.iter().map(str::to_string).collect(),
            "ingest",
            true,
            json!({"mode": "inline"}),
        )
        .await;
        return Ok((StatusCode::CREATED, Json(serde_json::to_value(outcome)?)));
    }

    let dedupe = request
        .idempotency_key
        .as_ref()
        .map(|key| format!("ingest:{slug}:{key}"));
    let job_id = state
        .queue
        .enqueue(
            names::INGEST,
            serde_json::to_value(QueuedIngest {
                dataset_slug: slug.clone(),
                request,
            })?,
            EnqueueOptions {
                job_id: dedupe,
                remove_on_complete: true,
                ..Default::default()
            },
        )
        .await?;

    state.metrics.ingestions.with_label_values(&["queued"]).inc();
    audit::record_access_event(
        &state.pool,
        &state.metrics,
        existing.map(|d| d.id),
        &slug,
        auth.actor(),
        auth.scopes.iter().map(str::to_string).collect(),
        "ingest",
        true,
        json!({"mode": "queued"}),
    )
    .await;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"jobId": job_id, "mode": "queued"})),
    ))
}
