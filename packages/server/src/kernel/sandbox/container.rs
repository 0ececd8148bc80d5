//! Container executor.
//!
//! Container runs are validated against runtime policy before anything
//! touches the daemon: image allow/deny globs (deny wins), network isolation,
//! the GPU gate, env/secret shape, and input mount paths. Violations surface
//! as `docker-policy` errors carrying a structured `docker` properties block;
//! the run completes as failed without retry.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use super::{LogBuffer, ResourceUsage, RunContext, SandboxExecutor, SandboxJob, Telemetry};
use crate::common::error::{CoreError, CoreResult, ErrorKind};
use crate::config::DockerConfig;

// ============================================================================
// Metadata
// ============================================================================

/// Secret reference for a container env var: the value lives in an external
/// store, never inline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretRef {
    pub source: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ContainerEnvVar {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretRef>,
}

/// Where an input mount's content comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", untagged)]
pub enum MountSource {
    Node { node_id: String },
    Backend { backend_mount_id: String, path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMount {
    pub id: String,
    pub source: MountSource,
    pub workspace_path: String,
}

/// The `docker` block of a container job definition.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerJobMetadata {
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<ContainerEnvVar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    pub gpu: bool,
    pub inputs: Vec<InputMount>,
}

impl DockerJobMetadata {
    /// Pull the `docker` block out of definition metadata.
    pub fn from_metadata(metadata: &serde_json::Value) -> CoreResult<Self> {
        let block = metadata.get("docker").ok_or_else(|| {
            CoreError::validation("container job missing metadata.docker block")
        })?;
        serde_json::from_value(block.clone())
            .map_err(|e| CoreError::validation(format!("invalid docker metadata: {e}")))
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Glob match supporting `*` and `?`.
pub fn pattern_matches(pattern: &str, candidate: &str) -> bool {
    fn inner(p: &[u8], c: &[u8]) -> bool {
        match (p.first(), c.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], c) || (!c.is_empty() && inner(p, &c[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &c[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &c[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), candidate.as_bytes())
}

/// Network policy resolved from configuration.
#[derive(Debug, Clone)]
pub struct NetworkPolicy {
    pub isolation_enabled: bool,
    pub allow_mode_override: bool,
    pub allowed_modes: Vec<String>,
    pub default_mode: String,
}

impl NetworkPolicy {
    /// Resolve the effective network mode for a run. When isolation is
    /// enforced the mode is `none` and overrides are ignored.
    pub fn resolve(&self, requested: Option<&str>) -> Result<String, String> {
        if self.isolation_enabled {
            return Ok("none".to_string());
        }
        match requested {
            None => Ok(self.default_mode.clone()),
            Some(mode) => {
                if !self.allow_mode_override {
                    return Err("network mode overrides are disabled".to_string());
                }
                if self.allowed_modes.iter().any(|m| m == mode) {
                    Ok(mode.to_string())
                } else {
                    Err(format!("network mode {mode} is not allowed"))
                }
            }
        }
    }
}

/// Full container policy, derived from `DockerConfig`.
#[derive(Debug, Clone)]
pub struct DockerPolicy {
    pub image_allowlist: Vec<String>,
    pub image_denylist: Vec<String>,
    pub enable_gpu: bool,
    pub network: NetworkPolicy,
}

impl DockerPolicy {
    pub fn from_config(config: &DockerConfig) -> Self {
        Self {
            image_allowlist: config.image_allowlist.clone(),
            image_denylist: config.image_denylist.clone(),
            enable_gpu: config.enable_gpu,
            network: NetworkPolicy {
                isolation_enabled: config.enforce_network_isolation,
                allow_mode_override: config.allow_network_override,
                allowed_modes: config.allowed_network_modes.clone(),
                default_mode: config.default_network_mode.clone(),
            },
        }
    }

    /// Deny wins over allow; an empty allow list admits anything not denied.
    pub fn image_allowed(&self, image: &str) -> bool {
        if self
            .image_denylist
            .iter()
            .any(|p| pattern_matches(p, image))
        {
            return false;
        }
        self.image_allowlist.is_empty()
            || self
                .image_allowlist
                .iter()
                .any(|p| pattern_matches(p, image))
    }

    /// Validate metadata, collecting every violation before failing.
    pub fn validate(&self, meta: &DockerJobMetadata) -> Result<ResolvedContainer, Vec<String>> {
        let mut errors = Vec::new();

        if meta.image.trim().is_empty() {
            errors.push("image is required".to_string());
        } else if !self.image_allowed(&meta.image) {
            errors.push(format!("image {} violates the image policy", meta.image));
        }

        let network_mode = match self.network.resolve(meta.network_mode.as_deref()) {
            Ok(mode) => mode,
            Err(e) => {
                errors.push(e);
                "none".to_string()
            }
        };

        if meta.gpu && !self.enable_gpu {
            errors.push("gpu requested but GPU jobs are disabled".to_string());
        }

        for var in &meta.env {
            match (&var.value, &var.secret) {
                (Some(_), Some(_)) => errors.push(format!(
                    "env {} declares both an inline value and a secret reference",
                    var.name
                )),
                (None, None) => {
                    errors.push(format!("env {} has neither value nor secret", var.name))
                }
                _ => {}
            }
            if var.name.trim().is_empty() {
                errors.push("env var with empty name".to_string());
            }
        }

        let mut seen_mounts = HashSet::new();
        for mount in &meta.inputs {
            if !seen_mounts.insert(mount.id.clone()) {
                errors.push(format!("duplicate input mount id {}", mount.id));
            }
            if !is_relative_subpath(&mount.workspace_path) {
                errors.push(format!(
                    "input {} workspacePath must be a relative subpath: {}",
                    mount.id, mount.workspace_path
                ));
            }
        }

        if errors.is_empty() {
            Ok(ResolvedContainer {
                image: meta.image.clone(),
                command: meta.command.clone(),
                network_mode,
                gpu: meta.gpu,
            })
        } else {
            Err(errors)
        }
    }
}

fn is_relative_subpath(path: &str) -> bool {
    let p = Path::new(path);
    !path.is_empty()
        && p.is_relative()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Policy-approved container parameters.
#[derive(Debug, Clone)]
pub struct ResolvedContainer {
    pub image: String,
    pub command: Vec<String>,
    pub network_mode: String,
    pub gpu: bool,
}

// ============================================================================
// Driver
// ============================================================================

/// Everything the daemon adapter needs to start a run.
#[derive(Debug, Clone)]
pub struct ContainerRunSpec {
    pub run_id: Uuid,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub network_mode: String,
    pub gpu: bool,
    pub workspace_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ContainerOutcome {
    pub exit_code: i32,
    pub result: Option<serde_json::Value>,
}

/// Daemon adapter contract; tests substitute a double.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn run(
        &self,
        spec: &ContainerRunSpec,
        logs: &LogBuffer,
        cancel: &CancellationToken,
    ) -> CoreResult<ContainerOutcome>;
}

/// `docker run` via the CLI.
pub struct CliContainerDriver;

#[async_trait]
impl ContainerDriver for CliContainerDriver {
    async fn run(
        &self,
        spec: &ContainerRunSpec,
        logs: &LogBuffer,
        cancel: &CancellationToken,
    ) -> CoreResult<ContainerOutcome> {
        let container_name = format!("strata-run-{}", spec.run_id);
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(&container_name)
            .arg("--network")
            .arg(&spec.network_mode)
            .arg("-v")
            .arg(format!("{}:/workspace", spec.workspace_dir.display()));
        if spec.gpu {
            cmd.arg("--gpus").arg("all");
        }
        for (name, value) in &spec.env {
            cmd.arg("-e").arg(format!("{name}={value}"));
        }
        cmd.arg(&spec.image);
        cmd.args(&spec.command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| CoreError::unavailable(format!("docker spawn: {e}")))?;

        if let Some(stdout) = child.stdout.take() {
            let stdout_logs = logs.clone();
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = tokio::io::BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stdout_logs.push(line, None);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let stderr_logs = logs.clone();
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stderr_logs.push(line, Some(serde_json::json!({"stream": "stderr"})));
                }
            });
        }

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| CoreError::execution(format!("docker wait: {e}")))?
            }
            _ = cancel.cancelled() => {
                let _ = Command::new("docker")
                    .arg("stop")
                    .arg(&container_name)
                    .output()
                    .await;
                let _ = child.wait().await;
                return Err(CoreError::cancelled("container run canceled"));
            }
        };

        Ok(ContainerOutcome {
            exit_code: status.code().unwrap_or(-1),
            result: None,
        })
    }
}

// ============================================================================
// Executor
// ============================================================================

pub struct ContainerExecutor {
    policy: DockerPolicy,
    workspace_root: PathBuf,
    driver: Arc<dyn ContainerDriver>,
}

impl ContainerExecutor {
    pub fn new(
        policy: DockerPolicy,
        workspace_root: impl Into<PathBuf>,
        driver: Arc<dyn ContainerDriver>,
    ) -> Self {
        Self {
            policy,
            workspace_root: workspace_root.into(),
            driver,
        }
    }

    fn policy_error(errors: Vec<String>) -> CoreError {
        CoreError::new(ErrorKind::DockerPolicy, "container metadata violates policy")
            .with_property(
                "docker",
                serde_json::json!({ "validationErrors": errors }),
            )
    }

    /// Resolve secret env vars through the run context; inline values pass
    /// through untouched. Resolved values never reach logs.
    async fn resolve_env(
        meta: &DockerJobMetadata,
        ctx: &Arc<dyn RunContext>,
    ) -> CoreResult<Vec<(String, String)>> {
        let mut env = Vec::with_capacity(meta.env.len());
        for var in &meta.env {
            if let Some(value) = &var.value {
                env.push((var.name.clone(), value.clone()));
            } else if let Some(secret) = &var.secret {
                let reference = format!("{}:{}", secret.source, secret.key);
                let value = ctx.resolve_secret(&reference).await?.ok_or_else(|| {
                    CoreError::execution(format!("secret {reference} did not resolve"))
                        .with_property("reference", serde_json::json!(reference))
                })?;
                env.push((var.name.clone(), value));
            }
        }
        Ok(env)
    }
}

#[async_trait]
impl SandboxExecutor for ContainerExecutor {
    async fn execute(&self, job: SandboxJob, ctx: Arc<dyn RunContext>) -> CoreResult<Telemetry> {
        let meta = DockerJobMetadata::from_metadata(&job.metadata)?;
        let resolved = self
            .policy
            .validate(&meta)
            .map_err(Self::policy_error)?;

        let workspace_dir = self.workspace_root.join(format!("run-{}", job.run_id));
        tokio::fs::create_dir_all(&workspace_dir)
            .await
            .map_err(|e| CoreError::unavailable(format!("workspace create: {e}")))?;

        let env = Self::resolve_env(&meta, &ctx).await?;
        let spec = ContainerRunSpec {
            run_id: job.run_id,
            image: resolved.image,
            command: resolved.command,
            env,
            network_mode: resolved.network_mode,
            gpu: resolved.gpu,
            workspace_dir: workspace_dir.clone(),
        };

        let logs = LogBuffer::default();
        let started = Instant::now();
        let outcome = match job.timeout {
            Some(timeout) => {
                tokio::select! {
                    outcome = self.driver.run(&spec, &logs, &job.cancel) => outcome,
                    _ = tokio::time::sleep(timeout) => {
                        job.cancel.cancel();
                        Err(CoreError::timeout(format!(
                            "container exceeded {}ms wall clock",
                            timeout.as_millis()
                        )))
                    }
                }
            }
            None => self.driver.run(&spec, &logs, &job.cancel).await,
        };

        // The whole per-run subtree goes; cleanup failures are logged only.
        if let Err(e) = tokio::fs::remove_dir_all(&workspace_dir).await {
            warn!(dir = %workspace_dir.display(), error = %e, "workspace cleanup failed");
        }

        let wall_ms = started.elapsed().as_millis() as u64;
        let (entries, truncated) = logs.drain();

        let outcome = outcome?;
        if outcome.exit_code != 0 {
            return Err(CoreError::execution(format!(
                "container exited with status {}",
                outcome.exit_code
            ))
            .with_property("exitCode", serde_json::json!(outcome.exit_code)));
        }

        Ok(Telemetry {
            task_id: job.run_id,
            duration_ms: wall_ms,
            logs: entries,
            truncated_log_count: truncated,
            resource_usage: ResourceUsage {
                wall_ms,
                cpu_ms: None,
                max_rss_bytes: None,
            },
            result: outcome.result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::bundles::BundleManifest;

    fn policy() -> DockerPolicy {
        DockerPolicy {
            image_allowlist: vec!["registry.example.com/*".to_string()],
            image_denylist: vec!["registry.example.com/blocked*".to_string()],
            enable_gpu: false,
            network: NetworkPolicy {
                isolation_enabled: true,
                allow_mode_override: false,
                allowed_modes: vec!["none".to_string(), "bridge".to_string()],
                default_mode: "none".to_string(),
            },
        }
    }

    fn meta(image: &str) -> DockerJobMetadata {
        DockerJobMetadata {
            image: image.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn glob_patterns() {
        assert!(pattern_matches("registry.example.com/*", "registry.example.com/app:latest"));
        assert!(!pattern_matches("registry.example.com/*", "other.registry/app"));
        assert!(pattern_matches("app-?", "app-1"));
        assert!(!pattern_matches("app-?", "app-12"));
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("a*c", "abc"));
        assert!(pattern_matches("a*c", "ac"));
    }

    #[test]
    fn deny_wins_over_allow() {
        let policy = policy();
        assert!(policy.image_allowed("registry.example.com/app:latest"));
        assert!(!policy.image_allowed("registry.example.com/blocked:1"));
        assert!(!policy.image_allowed("other.registry/app:latest"));
    }

    #[test]
    fn empty_allowlist_admits_anything_not_denied() {
        let policy = DockerPolicy {
            image_allowlist: vec![],
            image_denylist: vec!["bad/*".to_string()],
            ..policy()
        };
        assert!(policy.image_allowed("whatever/app"));
        assert!(!policy.image_allowed("bad/app"));
    }

    #[test]
    fn isolation_forces_none_and_ignores_overrides() {
        let net = policy().network;
        assert_eq!(net.resolve(Some("bridge")).unwrap(), "none");
        assert_eq!(net.resolve(None).unwrap(), "none");
    }

    #[test]
    fn overrides_honored_when_isolation_off() {
        let net = NetworkPolicy {
            isolation_enabled: false,
            allow_mode_override: true,
            allowed_modes: vec!["none".to_string(), "bridge".to_string()],
            default_mode: "none".to_string(),
        };
        assert_eq!(net.resolve(Some("bridge")).unwrap(), "bridge");
        assert_eq!(net.resolve(None).unwrap(), "none");
        assert!(net.resolve(Some("host")).is_err());

        let locked = NetworkPolicy {
            allow_mode_override: false,
            ..net
        };
        assert!(locked.resolve(Some("bridge")).is_err());
    }

    #[test]
    fn gpu_rejected_unless_enabled() {
        let policy = policy();
        let mut m = meta("registry.example.com/app");
        m.gpu = true;
        let errors = policy.validate(&m).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("gpu")));
    }

    #[test]
    fn secret_env_rejects_inline_values() {
        let policy = policy();
        let mut m = meta("registry.example.com/app");
        m.env = vec![ContainerEnvVar {
            name: "TOKEN".to_string(),
            value: Some("inline".to_string()),
            secret: Some(SecretRef {
                source: "vault".to_string(),
                key: "token".to_string(),
            }),
        }];
        let errors = policy.validate(&m).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("TOKEN")));
    }

    #[test]
    fn mounts_must_be_unique_relative_subpaths() {
        let policy = policy();
        let mut m = meta("registry.example.com/app");
        let mount = |id: &str, path: &str| InputMount {
            id: id.to_string(),
            source: MountSource::Node {
                node_id: "n1".to_string(),
            },
            workspace_path: path.to_string(),
        };
        m.inputs = vec![
            mount("a", "inputs/data"),
            mount("a", "inputs/other"),
            mount("b", "../escape"),
            mount("c", "/abs"),
        ];
        let errors = policy.validate(&m).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("duplicate")));
        assert!(errors.iter().any(|e| e.contains("../escape")));
        assert!(errors.iter().any(|e| e.contains("/abs")));
    }

    #[test]
    fn valid_metadata_resolves() {
        let policy = policy();
        let resolved = policy.validate(&meta("registry.example.com/app")).unwrap();
        assert_eq!(resolved.network_mode, "none");
        assert!(!resolved.gpu);
    }

    struct FakeDriver {
        exit_code: i32,
    }

    #[async_trait]
    impl ContainerDriver for FakeDriver {
        async fn run(
            &self,
            spec: &ContainerRunSpec,
            logs: &LogBuffer,
            _cancel: &CancellationToken,
        ) -> CoreResult<ContainerOutcome> {
            assert!(spec.workspace_dir.exists());
            logs.push("container ran", None);
            Ok(ContainerOutcome {
                exit_code: self.exit_code,
                result: Some(serde_json::json!({"ok": true})),
            })
        }
    }

    struct NoopContext;

    #[async_trait]
    impl RunContext for NoopContext {
        async fn update(&self, _patch: serde_json::Value) -> CoreResult<()> {
            Ok(())
        }
        async fn heartbeat(&self) -> CoreResult<()> {
            Ok(())
        }
        async fn resolve_secret(&self, reference: &str) -> CoreResult<Option<String>> {
            Ok(Some(format!("resolved:{reference}")))
        }
        fn log(&self, _message: &str, _meta: Option<serde_json::Value>) {}
    }

    fn sandbox_job(metadata: serde_json::Value) -> SandboxJob {
        SandboxJob {
            run_id: Uuid::now_v7(),
            slug: "containerized".to_string(),
            bundle_dir: None,
            manifest: BundleManifest::default(),
            export: None,
            parameters: serde_json::json!({}),
            metadata,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn executor_runs_and_cleans_workspace() {
        let root = tempfile::tempdir().unwrap();
        let executor = ContainerExecutor::new(
            policy(),
            root.path(),
            Arc::new(FakeDriver { exit_code: 0 }),
        );
        let job = sandbox_job(serde_json::json!({
            "docker": { "image": "registry.example.com/app:latest" }
        }));
        let run_id = job.run_id;

        let telemetry = executor.execute(job, Arc::new(NoopContext)).await.unwrap();
        assert_eq!(telemetry.result, Some(serde_json::json!({"ok": true})));
        assert!(!root.path().join(format!("run-{run_id}")).exists());
    }

    #[tokio::test]
    async fn policy_violation_is_docker_policy_with_context() {
        let root = tempfile::tempdir().unwrap();
        let executor = ContainerExecutor::new(
            policy(),
            root.path(),
            Arc::new(FakeDriver { exit_code: 0 }),
        );
        let job = sandbox_job(serde_json::json!({
            "docker": { "image": "other.registry/app:latest" }
        }));

        let err = executor.execute(job, Arc::new(NoopContext)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DockerPolicy);
        let docker = err.property("docker").unwrap();
        assert!(docker["validationErrors"].as_array().unwrap().len() == 1);
    }

    #[tokio::test]
    async fn nonzero_exit_is_execution_error() {
        let root = tempfile::tempdir().unwrap();
        let executor = ContainerExecutor::new(
            policy(),
            root.path(),
            Arc::new(FakeDriver { exit_code: 3 }),
        );
        let job = sandbox_job(serde_json::json!({
            "docker": { "image": "registry.example.com/app" }
        }));
        let err = executor.execute(job, Arc::new(NoopContext)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Execution);
        assert_eq!(err.property("exitCode"), Some(&serde_json::json!(3)));
    }
}
