//! In-process sandbox.
//!
//! Runs bundle entries that were compiled into this binary and registered at
//! startup, keyed by `(bundle slug, export)`. The entry receives a
//! capability-fenced environment handle; filesystem and network access are
//! denied unless the bundle manifest declares the matching capability flag.
//! A wall-clock watchdog enforces the timeout independently of the entry's
//! cooperative progress.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::{LogBuffer, ResourceUsage, RunContext, SandboxExecutor, SandboxJob, Telemetry};
use crate::common::error::{CoreError, CoreResult};

/// Capability-fenced resource handle passed to in-process entries.
pub struct SandboxEnv {
    capabilities: Vec<String>,
    bundle_dir: Option<PathBuf>,
    logs: LogBuffer,
    http: reqwest::Client,
}

impl SandboxEnv {
    fn denied(capability: &str) -> CoreError {
        CoreError::not_authorized(format!("capability {capability} not declared"))
            .with_property("capability", serde_json::json!(capability))
    }

    fn check(&self, capability: &str) -> CoreResult<()> {
        if self.capabilities.iter().any(|c| c == capability) {
            Ok(())
        } else {
            Err(Self::denied(capability))
        }
    }

    /// Read a file from the extracted bundle directory. Requires `fs`.
    pub async fn read_file(&self, relative: &str) -> CoreResult<Vec<u8>> {
        self.check("fs")?;
        let root = self
            .bundle_dir
            .as_deref()
            .ok_or_else(|| CoreError::validation("no bundle directory for this run"))?;
        let path = safe_join(root, relative)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| CoreError::execution(format!("read {relative}: {e}")))
    }

    /// Write a file under the bundle scratch space. Requires `fs`.
    pub async fn write_file(&self, relative: &str, contents: &[u8]) -> CoreResult<()> {
        self.check("fs")?;
        let root = self
            .bundle_dir
            .as_deref()
            .ok_or_else(|| CoreError::validation("no bundle directory for this run"))?;
        let path = safe_join(root, relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::execution(format!("mkdir for {relative}: {e}")))?;
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| CoreError::execution(format!("write {relative}: {e}")))
    }

    /// Fetch a URL. Requires `net`.
    pub async fn fetch(&self, url: &str) -> CoreResult<String> {
        self.check("net")?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::execution(format!("fetch {url}: {e}")))?;
        resp.text()
            .await
            .map_err(|e| CoreError::execution(format!("fetch body {url}: {e}")))
    }

    pub fn log(&self, message: impl Into<String>, meta: Option<serde_json::Value>) {
        self.logs.push(message, meta);
    }
}

fn safe_join(root: &Path, relative: &str) -> CoreResult<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(CoreError::validation(format!(
            "path escapes bundle directory: {relative}"
        )));
    }
    Ok(root.join(rel))
}

/// A registered in-process entry.
#[async_trait]
pub trait InprocEntry: Send + Sync {
    async fn run(
        &self,
        parameters: serde_json::Value,
        env: Arc<SandboxEnv>,
        ctx: Arc<dyn RunContext>,
    ) -> CoreResult<serde_json::Value>;
}

pub struct InprocSandbox {
    entries: HashMap<String, Arc<dyn InprocEntry>>,
}

fn entry_key(slug: &str, export: Option<&str>) -> String {
    match export {
        Some(export) => format!("{slug}#{export}"),
        None => slug.to_string(),
    }
}

impl InprocSandbox {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register(
        mut self,
        slug: &str,
        export: Option<&str>,
        entry: Arc<dyn InprocEntry>,
    ) -> Self {
        self.entries.insert(entry_key(slug, export), entry);
        self
    }
}

impl Default for InprocSandbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a single entry under the in-process fence and watchdog. Shared by the
/// bundle-backed sandbox, module targets, and static/fallback handlers.
pub async fn execute_entry(
    entry: Arc<dyn InprocEntry>,
    job: &SandboxJob,
    ctx: Arc<dyn RunContext>,
) -> CoreResult<Telemetry> {
    let logs = LogBuffer::default();
    let env = Arc::new(SandboxEnv {
        capabilities: job.manifest.capabilities.clone(),
        bundle_dir: job.bundle_dir.clone(),
        logs: logs.clone(),
        http: reqwest::Client::new(),
    });

    let started = Instant::now();
    let execution = entry.run(job.parameters.clone(), env, ctx);

    let result = match job.timeout {
        Some(timeout) => {
            tokio::select! {
                result = execution => result,
                _ = tokio::time::sleep(timeout) => {
                    debug!(run_id = %job.run_id, "in-process sandbox timed out");
                    Err(CoreError::timeout(format!(
                        "entry exceeded {}ms wall clock",
                        timeout.as_millis()
                    )))
                }
                _ = job.cancel.cancelled() => {
                    Err(CoreError::cancelled("run canceled"))
                }
            }
        }
        None => {
            tokio::select! {
                result = execution => result,
                _ = job.cancel.cancelled() => {
                    Err(CoreError::cancelled("run canceled"))
                }
            }
        }
    };

    let wall_ms = started.elapsed().as_millis() as u64;
    let (entries, truncated) = logs.drain();

    result.map(|value| Telemetry {
        task_id: job.run_id,
        duration_ms: wall_ms,
        logs: entries,
        truncated_log_count: truncated,
        resource_usage: ResourceUsage {
            wall_ms,
            cpu_ms: None,
            max_rss_bytes: None,
        },
        result: Some(value),
    })
}

#[async_trait]
impl SandboxExecutor for InprocSandbox {
    async fn execute(&self, job: SandboxJob, ctx: Arc<dyn RunContext>) -> CoreResult<Telemetry> {
        let entry = self
            .entries
            .get(&entry_key(&job.slug, job.export.as_deref()))
            .or_else(|| self.entries.get(&entry_key(&job.slug, None)))
            .cloned()
            .ok_or_else(|| {
                CoreError::execution(format!(
                    "no in-process entry registered for {}",
                    entry_key(&job.slug, job.export.as_deref())
                ))
            })?;
        execute_entry(entry, &job, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::ErrorKind;
    use crate::kernel::bundles::BundleManifest;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct NoopContext;

    #[async_trait]
    impl RunContext for NoopContext {
        async fn update(&self, _patch: serde_json::Value) -> CoreResult<()> {
            Ok(())
        }
        async fn heartbeat(&self) -> CoreResult<()> {
            Ok(())
        }
        async fn resolve_secret(&self, _reference: &str) -> CoreResult<Option<String>> {
            Ok(None)
        }
        fn log(&self, _message: &str, _meta: Option<serde_json::Value>) {}
    }

    struct EchoEntry;

    #[async_trait]
    impl InprocEntry for EchoEntry {
        async fn run(
            &self,
            parameters: serde_json::Value,
            env: Arc<SandboxEnv>,
            _ctx: Arc<dyn RunContext>,
        ) -> CoreResult<serde_json::Value> {
            env.log("echoing", None);
            Ok(parameters)
        }
    }

    struct FsEntry;

    #[async_trait]
    impl InprocEntry for FsEntry {
        async fn run(
            &self,
            _parameters: serde_json::Value,
            env: Arc<SandboxEnv>,
            _ctx: Arc<dyn RunContext>,
        ) -> CoreResult<serde_json::Value> {
            env.write_file("out.txt", b"data").await?;
            Ok(serde_json::json!({}))
        }
    }

    struct SleepEntry;

    #[async_trait]
    impl InprocEntry for SleepEntry {
        async fn run(
            &self,
            _parameters: serde_json::Value,
            _env: Arc<SandboxEnv>,
            _ctx: Arc<dyn RunContext>,
        ) -> CoreResult<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::json!({}))
        }
    }

    fn job(slug: &str, manifest: BundleManifest, timeout: Option<Duration>) -> SandboxJob {
        SandboxJob {
            run_id: Uuid::now_v7(),
            slug: slug.to_string(),
            bundle_dir: None,
            manifest,
            export: None,
            parameters: serde_json::json!({"v": 1}),
            metadata: serde_json::json!({}),
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn executes_registered_entry_and_captures_logs() {
        let sandbox = InprocSandbox::new().register("echo", None, Arc::new(EchoEntry));
        let telemetry = sandbox
            .execute(job("echo", BundleManifest::default(), None), Arc::new(NoopContext))
            .await
            .unwrap();
        assert_eq!(telemetry.result, Some(serde_json::json!({"v": 1})));
        assert_eq!(telemetry.logs.len(), 1);
        assert_eq!(telemetry.truncated_log_count, 0);
    }

    #[tokio::test]
    async fn undeclared_capability_is_not_authorized() {
        let sandbox = InprocSandbox::new().register("writer", None, Arc::new(FsEntry));
        let err = sandbox
            .execute(
                job("writer", BundleManifest::default(), None),
                Arc::new(NoopContext),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotAuthorized);
        assert_eq!(err.property("capability"), Some(&serde_json::json!("fs")));
    }

    #[tokio::test]
    async fn declared_capability_passes_the_fence() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = InprocSandbox::new().register("writer", None, Arc::new(FsEntry));
        let manifest = BundleManifest {
            capabilities: vec!["fs".to_string()],
            ..Default::default()
        };
        let mut job = job("writer", manifest, None);
        job.bundle_dir = Some(dir.path().to_path_buf());
        sandbox.execute(job, Arc::new(NoopContext)).await.unwrap();
        assert!(dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn watchdog_times_out_slow_entries() {
        let sandbox = InprocSandbox::new().register("slow", None, Arc::new(SleepEntry));
        let err = sandbox
            .execute(
                job(
                    "slow",
                    BundleManifest::default(),
                    Some(Duration::from_millis(20)),
                ),
                Arc::new(NoopContext),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn cancellation_interrupts_entries() {
        let sandbox = InprocSandbox::new().register("slow", None, Arc::new(SleepEntry));
        let mut job = job("slow", BundleManifest::default(), None);
        let cancel = CancellationToken::new();
        job.cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            sandbox.execute(job, Arc::new(NoopContext)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let root = Path::new("/tmp/bundle");
        assert!(safe_join(root, "../outside").is_err());
        assert!(safe_join(root, "/etc/passwd").is_err());
        assert!(safe_join(root, "nested/ok.txt").is_ok());
    }
}
