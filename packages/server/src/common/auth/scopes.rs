//! Header-delivered IAM scopes.
//!
//! Scopes arrive as a comma-separated `X-IAM-Scopes` header with the caller id
//! in `X-IAM-User`. Per-dataset read/write scope lists live in the dataset's
//! `metadata.iam` block; when absent the configured global default scope
//! applies.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::common::error::{CoreError, CoreResult};

/// The set of scopes presented by a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    pub fn parse(header: &str) -> Self {
        Self(
            header
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    /// True when any of `required` is present. An empty requirement list
    /// means the resource is open.
    pub fn satisfies_any(&self, required: &[String]) -> bool {
        required.is_empty() || required.iter().any(|s| self.contains(s))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Authenticated request context.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user: Option<String>,
    pub scopes: ScopeSet,
}

impl AuthContext {
    pub fn new(user: Option<String>, scopes: ScopeSet) -> Self {
        Self { user, scopes }
    }

    /// Require a single named scope.
    pub fn require_scope(&self, scope: &str) -> CoreResult<()> {
        if self.scopes.contains(scope) {
            return Ok(());
        }
        Err(CoreError::not_authorized(format!("missing scope {scope}"))
            .with_property("requiredScopes", serde_json::json!([scope])))
    }

    /// Require any of the listed scopes, falling back to `default_scope`
    /// when the list is empty.
    pub fn require_any(&self, required: &[String], default_scope: &str) -> CoreResult<()> {
        if required.is_empty() {
            return self.require_scope(default_scope);
        }
        if self.scopes.satisfies_any(required) {
            return Ok(());
        }
        Err(CoreError::not_authorized("missing required scope")
            .with_property("requiredScopes", serde_json::json!(required)))
    }

    pub fn actor(&self) -> Option<&str> {
        self.user.as_deref()
    }
}

/// Per-dataset IAM policy stored under `metadata.iam`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatasetIamPolicy {
    pub read_scopes: Vec<String>,
    pub write_scopes: Vec<String>,
}

impl DatasetIamPolicy {
    /// Extract the policy from dataset metadata; absent or malformed blocks
    /// fall back to the empty (global-default) policy.
    pub fn from_metadata(metadata: &serde_json::Value) -> Self {
        metadata
            .get("iam")
            .and_then(|iam| serde_json::from_value(iam.clone()).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_header() {
        let scopes = ScopeSet::parse("timestore:read, timestore:write ,,admin");
        assert!(scopes.contains("timestore:read"));
        assert!(scopes.contains("timestore:write"));
        assert!(scopes.contains("admin"));
        assert!(!scopes.contains("other"));
    }

    #[test]
    fn empty_requirement_is_open() {
        let scopes = ScopeSet::parse("a");
        assert!(scopes.satisfies_any(&[]));
    }

    #[test]
    fn require_any_falls_back_to_default_scope() {
        let ctx = AuthContext::new(None, ScopeSet::parse("timestore:default"));
        assert!(ctx.require_any(&[], "timestore:default").is_ok());
        assert!(ctx.require_any(&[], "other-default").is_err());

        let required = vec!["ds:read".to_string()];
        let err = ctx.require_any(&required, "timestore:default").unwrap_err();
        assert_eq!(err.kind, crate::common::error::ErrorKind::NotAuthorized);
        assert_eq!(
            err.property("requiredScopes"),
            Some(&serde_json::json!(["ds:read"]))
        );
    }

    #[test]
    fn dataset_policy_from_metadata() {
        let metadata = serde_json::json!({
            "iam": { "readScopes": ["ds:read"], "writeScopes": ["ds:write"] }
        });
        let policy = DatasetIamPolicy::from_metadata(&metadata);
        assert_eq!(policy.read_scopes, vec!["ds:read"]);
        assert_eq!(policy.write_scopes, vec!["ds:write"]);

        let empty = DatasetIamPolicy::from_metadata(&serde_json::json!({}));
        assert!(empty.read_scopes.is_empty());
    }
}
