//! Job endpoints: definitions, runs, snippet publishing, bundle editor.

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::common::auth::AuthContext;
use crate::common::error::CoreError;
use crate::common::pagination::{clamp_limit, Cursor};
use crate::kernel::bundles::{pack_archive, BundleBinding, BundleRegistry, PublishBundle};
use crate::kernel::runtime::model::{JobRun, NewJobDefinition, RuntimeKind};
use crate::server::app::AppState;
use crate::server::error::ApiResult;

#[derive(Debug, Deserialize, Default)]
pub struct ListParams {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// `GET /jobs` — cursor-paginated definition listing.
pub async fn list_definitions_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_scope(&state.scopes.default_scope)?;
    let cursor = params.cursor.as_deref().map(Cursor::decode).transpose()?;
    let page = state
        .runtime
        .store()
        .list_definitions(cursor, clamp_limit(params.limit))
        .await?;
    Ok(Json(json!({
        "jobs": page.items,
        "nextCursor": page.next_cursor,
    })))
}

/// `POST /jobs` — upsert a definition. Container metadata is validated
/// against runtime policy here: a violating definition is rejected with
/// `validation` and no run is ever created.
pub async fn create_definition_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<NewJobDefinition>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    auth.require_scope(&state.scopes.admin_scope)?;
    state
        .runtime
        .validate_definition(&input, state.docker_policy.as_ref())?;
    let definition = state.runtime.store().upsert_definition(input).await?;
    let created = definition.version == 1;
    Ok((
        if created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        },
        Json(serde_json::to_value(definition)?),
    ))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRunBody {
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
}

/// `POST /jobs/{slug}/run` — create and dispatch a run.
pub async fn trigger_run_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(slug): Path<String>,
    body: Option<Json<TriggerRunBody>>,
) -> ApiResult<(StatusCode, Json<JobRun>)> {
    auth.require_scope(&state.scopes.default_scope)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let run = state
        .runtime
        .trigger_run(
            &slug,
            body.parameters.unwrap_or_else(|| json!({})),
            body.context.unwrap_or_else(|| json!({})),
            body.max_attempts,
        )
        .await?;
    let status = if run.status.is_terminal() {
        // Inline queues settle the run before responding.
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(run)))
}

/// `GET /jobs/{slug}/run` — recent runs for a definition.
pub async fn list_runs_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(slug): Path<String>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_scope(&state.scopes.default_scope)?;
    let definition = state
        .runtime
        .store()
        .definition_by_slug(&slug)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("job {slug} not found")))?;
    let runs = state
        .runtime
        .store()
        .list_runs(definition.id, clamp_limit(params.limit))
        .await?;
    Ok(Json(json!({"runs": runs})))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// `POST /jobs/runs/{runId}/cancel`.
pub async fn cancel_run_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(run_id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> ApiResult<Json<JobRun>> {
    auth.require_scope(&state.scopes.default_scope)?;
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "canceled by operator".to_string());
    let run = state
        .runtime
        .cancel_run(run_id, &reason)
        .await?
        .ok_or_else(|| {
            CoreError::cancelled("run is already settled")
                .with_property("runId", json!(run_id))
        })?;
    Ok(Json(run))
}

// ----------------------------------------------------------------------
// Python snippet publishing
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetBody {
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
    pub snippet: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
}

fn snippet_manifest(body: &SnippetBody) -> serde_json::Value {
    json!({
        "entry": "main.py",
        "runtime": "interpreter",
        "capabilities": body.capabilities,
        "exports": ["run"],
    })
}

async fn next_snippet_version(
    registry: &BundleRegistry,
    slug: &str,
) -> Result<String, CoreError> {
    let versions = registry.list_versions(slug, 1).await?;
    match versions.first() {
        Some(latest) => BundleRegistry::next_version(&latest.version),
        None => Ok("1.0.0".to_string()),
    }
}

/// `POST /jobs/python-snippet` — pack the snippet as a bundle, publish it,
/// and bind a job definition to the new version.
pub async fn python_snippet_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<SnippetBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    auth.require_scope(&state.scopes.admin_scope)?;
    let registry = state
        .bundles
        .as_ref()
        .ok_or_else(|| CoreError::unavailable("bundle registry not configured"))?;

    if body.snippet.trim().is_empty() {
        return Err(CoreError::validation("snippet must not be empty").into());
    }

    let manifest = snippet_manifest(&body);
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let archive = pack_archive(&[
        ("manifest.json", manifest_bytes.as_slice()),
        ("main.py", body.snippet.as_bytes()),
    ])?;
    let version = next_snippet_version(registry, &body.slug).await?;

    let published = registry
        .publish(PublishBundle {
            slug: body.slug.clone(),
            version: version.clone(),
            display_name: body.name.clone().unwrap_or_else(|| body.slug.clone()),
            manifest,
            capability_flags: body.capabilities.clone(),
            artifact: archive,
            published_by: auth.actor().map(str::to_string),
        })
        .await?;

    let definition = state
        .runtime
        .store()
        .upsert_definition(
            NewJobDefinition::builder()
                .slug(body.slug.clone())
                .name(body.name.unwrap_or_else(|| body.slug.clone()))
                .runtime(RuntimeKind::Interpreter)
                .entry_point(format!("bundle:{}@{}", body.slug, version))
                .timeout_ms(body.timeout_ms.unwrap_or(300_000))
                .build(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "job": definition,
            "bundle": {
                "slug": published.bundle_slug,
                "version": published.version,
                "checksum": published.checksum,
            },
        })),
    ))
}

/// `POST /jobs/python-snippet/preview` — what would be created, without
/// publishing anything.
pub async fn python_snippet_preview_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<SnippetBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    if body.snippet.trim().is_empty() {
        return Err(CoreError::validation("snippet must not be empty").into());
    }
    let manifest = snippet_manifest(&body);
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let archive = pack_archive(&[
        ("manifest.json", manifest_bytes.as_slice()),
        ("main.py", body.snippet.as_bytes()),
    ])?;
    let checksum = hex::encode(Sha256::digest(&archive));
    let version = match &state.bundles {
        Some(registry) => next_snippet_version(registry, &body.slug).await?,
        None => "1.0.0".to_string(),
    };
    Ok(Json(json!({
        "slug": body.slug,
        "version": version,
        "manifest": manifest,
        "checksum": checksum,
        "entryPoint": format!("bundle:{}@{}", body.slug, version),
    })))
}

// ----------------------------------------------------------------------
// Bundle editor
// ----------------------------------------------------------------------

/// `GET /jobs/{slug}/bundle-editor` — the definition's binding plus the
/// registry's view of that bundle.
pub async fn bundle_editor_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(slug): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_scope(&state.scopes.default_scope)?;
    let definition = state
        .runtime
        .store()
        .definition_by_slug(&slug)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("job {slug} not found")))?;
    let binding = BundleBinding::parse(&definition.entry_point)?;

    let versions = match (&binding, &state.bundles) {
        (Some(binding), Some(registry)) => registry
            .list_versions(&binding.slug, 20)
            .await?
            .into_iter()
            .map(|v| {
                json!({
                    "version": v.version,
                    "checksum": v.checksum,
                    "status": v.status,
                    "capabilityFlags": v.capability_flags,
                    "createdAt": v.created_at,
                })
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(Json(json!({
        "job": definition,
        "binding": binding,
        "versions": versions,
    })))
}

/// `POST /jobs/{slug}/bundle/regenerate` — republish the bound artifact
/// under the next version and rebind the definition.
pub async fn regenerate_bundle_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(slug): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_scope(&state.scopes.admin_scope)?;
    let registry = state
        .bundles
        .as_ref()
        .ok_or_else(|| CoreError::unavailable("bundle registry not configured"))?;

    let definition = state
        .runtime
        .store()
        .definition_by_slug(&slug)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("job {slug} not found")))?;
    let binding = BundleBinding::parse(&definition.entry_point)?.ok_or_else(|| {
        CoreError::validation(format!("job {slug} is not bundle-backed"))
    })?;

    let current = registry.resolve(&binding.slug, &binding.version).await?;
    let artifact = registry.store().get(&current.artifact_path).await?;
    let next_version = BundleRegistry::next_version(&current.version)?;

    let published = registry
        .publish(PublishBundle {
            slug: binding.slug.clone(),
            version: next_version.clone(),
            display_name: definition.name.clone(),
            manifest: current.manifest.clone(),
            capability_flags: current.capability_flags.clone(),
            artifact,
            published_by: auth.actor().map(str::to_string),
        })
        .await?;

    let mut rebound = NewJobDefinition::builder()
        .slug(definition.slug.clone())
        .name(definition.name.clone())
        .entry_point(format!("bundle:{}@{}", binding.slug, next_version))
        .build();
    rebound.runtime = RuntimeKind::parse(&definition.runtime)?;
    rebound.timeout_ms = definition.timeout_ms;
    rebound.parameters_schema = definition.parameters_schema.clone();
    rebound.default_parameters = definition.default_parameters.clone();
    rebound.output_schema = definition.output_schema.clone();
    rebound.metadata = definition.metadata.clone();
    let definition = state.runtime.store().upsert_definition(rebound).await?;

    Ok(Json(json!({
        "job": definition,
        "bundle": {
            "slug": published.bundle_slug,
            "version": published.version,
            "checksum": published.checksum,
        },
    })))
}
