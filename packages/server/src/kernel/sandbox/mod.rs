//! Sandbox executors.
//!
//! Three isolation strategies share one interface: an in-process execution
//! context for trusted entries, a subprocess interpreter speaking a
//! length-prefixed JSON protocol, and a container executor. All of them
//! return the same telemetry shape and honor the wall-clock watchdog.

pub mod container;
mod inproc;
mod subprocess;

pub use container::{
    CliContainerDriver, ContainerDriver, ContainerExecutor, ContainerOutcome, ContainerRunSpec,
    DockerJobMetadata, DockerPolicy, NetworkPolicy,
};
pub use inproc::{execute_entry, InprocEntry, InprocSandbox, SandboxEnv};
pub use subprocess::{InterpreterSandbox, ProtocolFrame};

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::error::CoreResult;
use crate::kernel::bundles::BundleManifest;

/// Log line captured during sandbox execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Resource accounting reported with every execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub wall_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rss_bytes: Option<u64>,
}

/// What an executor hands back to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub task_id: Uuid,
    pub duration_ms: u64,
    pub logs: Vec<LogEntry>,
    pub truncated_log_count: usize,
    pub resource_usage: ResourceUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Bounded log sink shared with the running entry. Overflow is counted, not
/// stored.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<LogBufferInner>>,
}

struct LogBufferInner {
    entries: Vec<LogEntry>,
    capacity: usize,
    truncated: usize,
}

pub const DEFAULT_LOG_CAPACITY: usize = 500;

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogBufferInner {
                entries: Vec::new(),
                capacity,
                truncated: 0,
            })),
        }
    }

    pub fn push(&self, message: impl Into<String>, meta: Option<serde_json::Value>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.len() >= inner.capacity {
            inner.truncated += 1;
            return;
        }
        inner.entries.push(LogEntry {
            at: Utc::now(),
            message: message.into(),
            meta,
        });
    }

    pub fn drain(&self) -> (Vec<LogEntry>, usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let truncated = inner.truncated;
        inner.truncated = 0;
        (std::mem::take(&mut inner.entries), truncated)
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

/// Callbacks the sandbox exposes to the running entry, backed by the job
/// runtime (heartbeats and patches persist to the run row; secret values are
/// audited and never logged).
#[async_trait]
pub trait RunContext: Send + Sync {
    async fn update(&self, patch: serde_json::Value) -> CoreResult<()>;
    async fn heartbeat(&self) -> CoreResult<()>;
    async fn resolve_secret(&self, reference: &str) -> CoreResult<Option<String>>;
    fn log(&self, message: &str, meta: Option<serde_json::Value>);
}

/// One sandbox invocation.
pub struct SandboxJob {
    pub run_id: Uuid,
    pub slug: String,
    /// Extracted bundle directory, when the entry is bundle-backed.
    pub bundle_dir: Option<PathBuf>,
    pub manifest: BundleManifest,
    pub export: Option<String>,
    pub parameters: serde_json::Value,
    /// Definition metadata (container jobs carry their `docker` block here).
    pub metadata: serde_json::Value,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

/// Shared executor interface (§4.5).
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(&self, job: SandboxJob, ctx: Arc<dyn RunContext>) -> CoreResult<Telemetry>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_counts_overflow() {
        let buffer = LogBuffer::new(2);
        buffer.push("one", None);
        buffer.push("two", None);
        buffer.push("three", None);
        buffer.push("four", None);

        let (entries, truncated) = buffer.drain();
        assert_eq!(entries.len(), 2);
        assert_eq!(truncated, 2);

        // Drained state resets the counter.
        let (entries, truncated) = buffer.drain();
        assert!(entries.is_empty());
        assert_eq!(truncated, 0);
    }
}
