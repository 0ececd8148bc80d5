//! Prometheus text exposition.

use axum::extract::Extension;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;

use crate::common::auth::AuthContext;
use crate::server::app::AppState;
use crate::server::error::ApiResult;

pub async fn metrics_handler(
    Extension(state): Extension<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<impl IntoResponse> {
    // The metrics endpoint is open unless a scope is configured.
    if let Some(scope) = &state.scopes.metrics_scope {
        auth.require_scope(scope)?;
    }
    let body = state.metrics.render()?;
    Ok((
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ))
}
