//! Tagged error value shared by every subsystem.
//!
//! Errors carry a machine-readable `kind`, a human message, and an optional
//! `properties` map with actionable fields (validation errors, missing
//! capability names, offending paths). The HTTP layer switches on `kind` to
//! choose a status code; nothing anywhere matches on message strings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Input failed schema/shape validation.
    Validation,
    /// Scope or capability missing.
    NotAuthorized,
    /// Referenced entity absent.
    NotFound,
    /// `ifMatch` timestamp mismatch.
    ConcurrentUpdate,
    /// Unique-key collision.
    Duplicate,
    /// Bundle missing from the registry.
    BundleNotFound,
    /// Bundle artifact failed checksum verification.
    BundleCorrupt,
    /// Bundle artifact could not be materialized (transport).
    AcquireFailed,
    /// Container metadata violates runtime policy.
    DockerPolicy,
    /// Handler threw.
    Execution,
    /// Wall-clock exceeded.
    Timeout,
    /// Operator cancel.
    Cancelled,
    /// Dependency temporarily down.
    Unavailable,
}

impl ErrorKind {
    /// Whether the runtime's retry policy applies to this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Execution
                | ErrorKind::Timeout
                | ErrorKind::AcquireFailed
                | ErrorKind::Unavailable
        )
    }

    /// The kebab-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotAuthorized => "not-authorized",
            ErrorKind::NotFound => "not-found",
            ErrorKind::ConcurrentUpdate => "concurrent-update",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::BundleNotFound => "bundle-not-found",
            ErrorKind::BundleCorrupt => "bundle-corrupt",
            ErrorKind::AcquireFailed => "acquire-failed",
            ErrorKind::DockerPolicy => "docker-policy",
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}

/// The error value used across the platform.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{}: {message}", .kind.as_str())]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, serde_json::Value>>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            properties: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_authorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAuthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn concurrent_update(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConcurrentUpdate, message)
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Duplicate, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// Attach a single actionable property.
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    /// Attach a full properties map.
    pub fn with_properties(mut self, props: BTreeMap<String, serde_json::Value>) -> Self {
        self.properties = Some(props);
        self
    }

    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.as_ref().and_then(|p| p.get(key))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => CoreError::not_found("row not found"),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CoreError::duplicate(format!("unique constraint violated: {db}"))
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                CoreError::unavailable(format!("database unavailable: {err}"))
            }
            _ => CoreError::new(ErrorKind::Execution, format!("database error: {err}")),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::validation(format!("invalid JSON: {err}"))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
