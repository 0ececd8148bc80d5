//! IAM header extraction.
//!
//! Scopes arrive in `X-IAM-Scopes` (comma-separated) with the caller id in
//! `X-IAM-User`. The middleware attaches an `AuthContext` to every request;
//! handlers enforce the scopes they need.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::common::auth::{AuthContext, ScopeSet};
use crate::common::error::CoreResult;
use crate::domains::datasets::Dataset;

pub const SCOPES_HEADER: &str = "x-iam-scopes";
pub const USER_HEADER: &str = "x-iam-user";

pub async fn iam_context_middleware(mut request: Request, next: Next) -> Response {
    let scopes = request
        .headers()
        .get(SCOPES_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ScopeSet::parse)
        .unwrap_or_default();
    let user = request
        .headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    request
        .extensions_mut()
        .insert(AuthContext::new(user, scopes));
    next.run(request).await
}

/// Per-dataset read check: the dataset's `metadata.iam.readScopes`, falling
/// back to the configured default scope when absent.
pub fn require_dataset_read(
    auth: &AuthContext,
    dataset: &Dataset,
    default_scope: &str,
) -> CoreResult<()> {
    auth.require_any(&dataset.iam_policy().read_scopes, default_scope)
}

pub fn require_dataset_write(
    auth: &AuthContext,
    dataset: &Dataset,
    default_scope: &str,
) -> CoreResult<()> {
    auth.require_any(&dataset.iam_policy().write_scopes, default_scope)
}
