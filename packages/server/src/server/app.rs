//! Application state and router assembly.

use std::sync::Arc;

use axum::extract::Extension;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use sqlx::postgres::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tokio::sync::mpsc;

use crate::config::ScopeConfig;
use crate::domains::columnar::ColumnarDriver;
use crate::domains::filestore::FilestoreEvent;
use crate::domains::ingest::IngestPipeline;
use crate::domains::lifecycle::LifecycleEngine;
use crate::domains::query::{QueryExecutor, SqlNameCache};
use crate::kernel::bundles::BundleRegistry;
use crate::kernel::metrics::Metrics;
use crate::kernel::queue::Queue;
use crate::kernel::runtime::JobRuntime;
use crate::kernel::sandbox::DockerPolicy;
use crate::server::middleware::iam_context_middleware;
use crate::server::routes;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub queue: Arc<dyn Queue>,
    pub runtime: Arc<JobRuntime>,
    pub bundles: Option<Arc<BundleRegistry>>,
    pub pipeline: Arc<IngestPipeline>,
    pub executor: Arc<QueryExecutor>,
    pub lifecycle: Arc<LifecycleEngine>,
    pub sql_cache: Arc<SqlNameCache>,
    pub columnar: Option<Arc<dyn ColumnarDriver>>,
    pub metrics: Metrics,
    pub scopes: ScopeConfig,
    pub docker_policy: Option<DockerPolicy>,
    /// Inline emitter into the filestore consumer, when streaming is on.
    pub filestore: Option<mpsc::Sender<FilestoreEvent>>,
}

impl AppState {
    pub fn streaming_enabled(&self) -> bool {
        self.filestore.is_some()
    }
}

/// Assemble the HTTP surface.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Liveness / readiness / metrics
        .route("/health", get(routes::health::health_handler))
        .route("/ready", get(routes::health::ready_handler))
        .route("/metrics", get(routes::metrics::metrics_handler))
        // Datasets
        .route("/datasets/:slug/ingest", post(routes::ingest::ingest_handler))
        .route("/datasets/:slug/query", post(routes::query::query_handler))
        // SQL
        .route("/sql/read", post(routes::sql::read_handler))
        .route("/sql/exec", post(routes::sql::exec_handler))
        .route("/sql/saved", get(routes::sql::list_saved_handler))
        .route(
            "/sql/saved/:id",
            get(routes::sql::get_saved_handler)
                .put(routes::sql::put_saved_handler)
                .delete(routes::sql::delete_saved_handler),
        )
        // Admin: lifecycle
        .route(
            "/admin/lifecycle/run",
            post(routes::lifecycle_admin::run_handler),
        )
        .route(
            "/admin/lifecycle/status",
            get(routes::lifecycle_admin::status_handler),
        )
        .route(
            "/admin/lifecycle/reschedule",
            post(routes::lifecycle_admin::reschedule_handler),
        )
        // Admin: datasets
        .route(
            "/admin/datasets",
            get(routes::datasets_admin::list_handler).post(routes::datasets_admin::create_handler),
        )
        .route(
            "/admin/datasets/:id",
            get(routes::datasets_admin::get_handler)
                .patch(routes::datasets_admin::patch_handler),
        )
        .route(
            "/admin/datasets/:id/archive",
            post(routes::datasets_admin::archive_handler),
        )
        .route(
            "/admin/datasets/:id/manifests",
            get(routes::datasets_admin::manifests_handler),
        )
        .route(
            "/admin/datasets/:id/audit",
            get(routes::datasets_admin::audit_handler),
        )
        .route(
            "/admin/datasets/:id/retention",
            get(routes::datasets_admin::get_retention_handler)
                .put(routes::datasets_admin::put_retention_handler),
        )
        // Jobs
        .route(
            "/jobs",
            get(routes::jobs::list_definitions_handler)
                .post(routes::jobs::create_definition_handler),
        )
        .route(
            "/jobs/python-snippet",
            post(routes::jobs::python_snippet_handler),
        )
        .route(
            "/jobs/python-snippet/preview",
            post(routes::jobs::python_snippet_preview_handler),
        )
        .route(
            "/jobs/runs/:run_id/cancel",
            post(routes::jobs::cancel_run_handler),
        )
        .route(
            "/jobs/:slug/run",
            get(routes::jobs::list_runs_handler).post(routes::jobs::trigger_run_handler),
        )
        .route(
            "/jobs/:slug/bundle-editor",
            get(routes::jobs::bundle_editor_handler),
        )
        .route(
            "/jobs/:slug/bundle/regenerate",
            post(routes::jobs::regenerate_bundle_handler),
        )
        .layer(middleware::from_fn(iam_context_middleware))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
