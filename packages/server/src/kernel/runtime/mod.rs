//! Job runtime: dispatch, retries, recovery, cancellation.
//!
//! A run travels `pending → running → {succeeded | failed | canceled |
//! expired}`. Dispatch resolves the definition, parses an optional bundle
//! binding (a workflow-provided override in run context wins), selects the
//! executor by runtime kind, and executes under the wall-clock watchdog.
//! Retryable failures requeue per the definition's retry policy; bundle
//! resolution failures go through the recovery hook before the legacy static
//! fallback is considered.

pub mod model;
pub mod registry;
pub mod retry;
pub mod store;

mod context;

pub use context::RuntimeRunContext;
pub use registry::{
    bundles_enabled_for, fallback_allowed_for, BundleRecovery, ModuleBinding, ModuleTarget,
    ModuleTargetKind, ModuleTargetRegistry, NoRecovery, StaticHandlerRegistry,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult, ErrorKind};
use crate::config::BundleConfig;
use crate::kernel::bundles::{AcquiredBundle, BundleBinding, BundleCache, BundleManifest, BundleStore};
use crate::kernel::metrics::Metrics;
use crate::kernel::queue::{names, EnqueueOptions, JobEnvelope, Queue, QueueHandler};
use crate::kernel::sandbox::{
    execute_entry, RunContext, SandboxExecutor, SandboxJob, Telemetry,
};
use crate::kernel::secrets::SecretAccess;

use model::{JobDefinition, JobRun, NewJobDefinition, RunStatus, RuntimeKind};
use store::{JobStore, NewJobRun, RunCompletion};

/// Queue payload for a run dispatch.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDispatch {
    pub run_id: Uuid,
}

/// Everything the runtime needs, composed at startup (§9: interface set over
/// a dependency struct; tests construct it with doubles).
pub struct RuntimeDeps {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn Queue>,
    pub bundles: Option<Arc<dyn BundleStore>>,
    pub bundle_cache: Option<Arc<BundleCache>>,
    pub bundle_config: BundleConfig,
    pub secrets: Arc<SecretAccess>,
    pub metrics: Metrics,
    pub static_handlers: StaticHandlerRegistry,
    pub module_targets: ModuleTargetRegistry,
    pub recovery: Arc<dyn BundleRecovery>,
    pub interpreter: Option<Arc<dyn SandboxExecutor>>,
    pub container: Option<Arc<dyn SandboxExecutor>>,
}

pub struct JobRuntime {
    deps: RuntimeDeps,
    /// Cancellation tokens for in-flight runs.
    cancels: Mutex<HashMap<Uuid, CancellationToken>>,
}

const REPOSITORY_INGEST_SLUG: &str = "repository-ingest";
const REPOSITORY_BUILD_SLUG: &str = "repository-build";

impl JobRuntime {
    pub fn new(deps: RuntimeDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            cancels: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.deps.store.clone()
    }

    /// Validate a definition before it is stored. Container definitions get
    /// their docker metadata checked against policy here so a bad definition
    /// is rejected with `validation` and no run is ever created.
    pub fn validate_definition(
        &self,
        input: &NewJobDefinition,
        docker_policy: Option<&crate::kernel::sandbox::DockerPolicy>,
    ) -> CoreResult<()> {
        BundleBinding::parse(&input.entry_point)?;
        if input.runtime == RuntimeKind::Container {
            let meta =
                crate::kernel::sandbox::DockerJobMetadata::from_metadata(&input.metadata)?;
            if let Some(policy) = docker_policy {
                if let Err(errors) = policy.validate(&meta) {
                    return Err(CoreError::validation(
                        "container metadata violates runtime policy",
                    )
                    .with_property("docker", serde_json::json!({"validationErrors": errors})));
                }
            }
        }
        if input.runtime == RuntimeKind::Module {
            ModuleBinding::parse(&input.entry_point)?;
        }
        Ok(())
    }

    /// Create a run for a definition and enqueue its dispatch.
    pub async fn trigger_run(
        self: &Arc<Self>,
        slug: &str,
        parameters: serde_json::Value,
        context: serde_json::Value,
        max_attempts: Option<i32>,
    ) -> CoreResult<JobRun> {
        let definition = self
            .deps
            .store
            .definition_by_slug(slug)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("job {slug} not found")))?;

        let run = self
            .deps
            .store
            .create_run(NewJobRun {
                definition_id: definition.id,
                parameters,
                max_attempts,
                context,
            })
            .await?;

        self.deps.metrics.job_runs_started.inc();
        self.enqueue_dispatch(run.id, Duration::ZERO).await?;
        // Inline queues execute synchronously; return the settled row.
        let settled = self.deps.store.run(run.id).await?.unwrap_or(run);
        Ok(settled)
    }

    async fn enqueue_dispatch(&self, run_id: Uuid, delay: Duration) -> CoreResult<()> {
        self.deps
            .queue
            .enqueue(
                names::JOB_RUNS,
                serde_json::to_value(RunDispatch { run_id })?,
                EnqueueOptions {
                    delay_ms: Some(delay.as_millis() as i64),
                    remove_on_complete: true,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Cancel a run: pending runs settle immediately, running runs get their
    /// sandbox signalled and settle when the executor observes the token.
    pub async fn cancel_run(&self, run_id: Uuid, reason: &str) -> CoreResult<Option<JobRun>> {
        let updated = self.deps.store.cancel_run(run_id, reason).await?;
        if updated.is_some() {
            if let Some(token) = self
                .cancels
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&run_id)
            {
                token.cancel();
            }
            self.deps
                .metrics
                .job_runs_completed
                .with_label_values(&["canceled"])
                .inc();
        }
        Ok(updated)
    }

    /// Queue handler entry point: execute one run to a settled state.
    /// Persistence failures bubble up (the queue retries those); handler
    /// failures settle into the run row here.
    pub async fn execute_run(self: &Arc<Self>, run_id: Uuid) -> CoreResult<()> {
        let Some(run) = self.deps.store.run(run_id).await? else {
            warn!(run_id = %run_id, "dispatch for unknown run");
            return Ok(());
        };
        if run.status != RunStatus::Pending {
            // Canceled while queued, or a duplicate delivery.
            return Ok(());
        }

        let Some(definition) = self
            .deps
            .store
            .definition_by_id(run.job_definition_id)
            .await?
        else {
            self.complete(
                RunCompletion::failed(run_id, "definition-missing", "job definition missing"),
                "failed",
            )
            .await?;
            return Ok(());
        };

        // Repository-special slugs short-circuit to a domain queue.
        if definition.slug == REPOSITORY_INGEST_SLUG || definition.slug == REPOSITORY_BUILD_SLUG {
            return self.execute_repository_job(&definition, &run).await;
        }

        let Some(run) = self.deps.store.try_start_run(run_id).await? else {
            return Ok(());
        };

        let cancel = CancellationToken::new();
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id, cancel.clone());

        let outcome = self.dispatch(&definition, &run, cancel).await;

        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id);

        match outcome {
            Ok((telemetry, extra_context)) => {
                self.complete_success(&run, telemetry, extra_context).await
            }
            Err(err) => self.handle_failure(&definition, &run, err).await,
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn dispatch(
        self: &Arc<Self>,
        definition: &JobDefinition,
        run: &JobRun,
        cancel: CancellationToken,
    ) -> CoreResult<(Telemetry, serde_json::Value)> {
        let runtime_kind = definition.runtime_kind()?;
        let parameters = run.effective_parameters(definition);
        let timeout = run
            .effective_timeout_ms(definition)
            .map(|ms| Duration::from_millis(ms.max(0) as u64));

        let ctx: Arc<dyn RunContext> = Arc::new(RuntimeRunContext::new(
            run.id,
            definition.slug.clone(),
            self.deps.store.clone(),
            self.deps.secrets.clone(),
            Default::default(),
        ));

        let mut job = SandboxJob {
            run_id: run.id,
            slug: definition.slug.clone(),
            bundle_dir: None,
            manifest: BundleManifest::default(),
            export: None,
            parameters,
            metadata: definition.metadata.clone(),
            timeout,
            cancel,
        };

        match runtime_kind {
            RuntimeKind::Container => {
                let executor = self.deps.container.as_ref().ok_or_else(|| {
                    CoreError::new(ErrorKind::DockerPolicy, "container jobs are disabled")
                })?;
                let telemetry = executor.execute(job, ctx).await?;
                Ok((telemetry, serde_json::json!({})))
            }
            RuntimeKind::Module => {
                let binding = ModuleBinding::parse(&definition.entry_point)?;
                let handler = self.deps.module_targets.resolve(&binding)?;
                // Module targets are trusted first-party code.
                job.manifest = BundleManifest {
                    capabilities: vec!["fs".to_string(), "net".to_string()],
                    ..Default::default()
                };
                let telemetry = execute_entry(handler, &job, ctx).await?;
                Ok((telemetry, serde_json::json!({})))
            }
            RuntimeKind::Inproc | RuntimeKind::Interpreter => {
                self.dispatch_bundle_or_static(definition, run, job, ctx)
                    .await
            }
        }
    }

    /// Binding resolution order: run-context override, then the definition's
    /// entry point. Slugs with bundles disabled run their static handler.
    fn effective_binding(
        &self,
        definition: &JobDefinition,
        run: &JobRun,
    ) -> CoreResult<(Option<BundleBinding>, bool)> {
        if !bundles_enabled_for(&self.deps.bundle_config, &definition.slug) {
            return Ok((None, false));
        }
        if let Some(override_value) = run.context.get("bundleBinding") {
            let binding: BundleBinding = serde_json::from_value(override_value.clone())
                .map_err(|e| CoreError::validation(format!("invalid bundle override: {e}")))?;
            return Ok((Some(binding), true));
        }
        Ok((BundleBinding::parse(&definition.entry_point)?, false))
    }

    async fn dispatch_bundle_or_static(
        self: &Arc<Self>,
        definition: &JobDefinition,
        run: &JobRun,
        mut job: SandboxJob,
        ctx: Arc<dyn RunContext>,
    ) -> CoreResult<(Telemetry, serde_json::Value)> {
        let (binding, overridden) = self.effective_binding(definition, run)?;

        let Some(binding) = binding else {
            // Static handler registered at startup.
            let handler = self.deps.static_handlers.get(&definition.slug).ok_or_else(|| {
                CoreError::execution(format!(
                    "no handler registered for {}",
                    definition.slug
                ))
            })?;
            job.manifest = BundleManifest {
                capabilities: vec!["fs".to_string(), "net".to_string()],
                ..Default::default()
            };
            let telemetry = execute_entry(handler, &job, ctx).await?;
            return Ok((telemetry, serde_json::json!({})));
        };

        let mut extra_context = serde_json::json!({});
        if overridden {
            extra_context["bundleOverride"] = serde_json::json!(true);
        }

        let acquired = match self.acquire_binding(&binding).await {
            Ok(acquired) => acquired,
            Err(err)
                if matches!(err.kind, ErrorKind::BundleNotFound | ErrorKind::AcquireFailed) =>
            {
                match self.deps.recovery.recover(&binding).await? {
                    Some(recovered) => {
                        info!(
                            run_id = %run.id,
                            from = %binding,
                            to = %recovered,
                            "bundle recovered via hook"
                        );
                        let acquired = self.acquire_binding(&recovered).await?;
                        extra_context["bundleFallback"] = serde_json::json!({
                            "from": binding.to_string(),
                            "to": recovered.to_string(),
                        });
                        acquired
                    }
                    None => {
                        // Legacy static fallback, when allowed for this slug.
                        if fallback_allowed_for(&self.deps.bundle_config, &definition.slug) {
                            if let Some(handler) =
                                self.deps.static_handlers.get(&definition.slug)
                            {
                                job.manifest = BundleManifest {
                                    capabilities: vec!["fs".to_string(), "net".to_string()],
                                    ..Default::default()
                                };
                                extra_context["bundleFallback"] = serde_json::json!({
                                    "from": binding.to_string(),
                                    "mode": "static-handler",
                                });
                                let telemetry = execute_entry(handler, &job, ctx).await?;
                                return Ok((telemetry, extra_context));
                            }
                        }
                        return Err(err);
                    }
                }
            }
            Err(err) => return Err(err),
        };

        job.export = binding.export.clone();
        job.manifest = acquired.1.clone();
        job.bundle_dir = Some(acquired.0.dir.clone());

        // Language selection comes from the bundle manifest, not the
        // definition: interpreter bundles run out-of-process.
        let use_interpreter = matches!(acquired.1.runtime.as_str(), "interpreter" | "python");
        let result = if use_interpreter {
            let executor = self.deps.interpreter.as_ref().ok_or_else(|| {
                CoreError::unavailable("interpreter sandbox not configured")
            })?;
            executor.execute(job, ctx).await
        } else {
            match &self.deps.static_handlers.get(&definition.slug) {
                // In-process bundles execute through registered entries.
                Some(handler) => execute_entry(handler.clone(), &job, ctx).await,
                None => Err(CoreError::execution(format!(
                    "no in-process entry for bundle {}",
                    binding
                ))),
            }
        };

        acquired.0.release().await;
        result.map(|telemetry| (telemetry, extra_context))
    }

    async fn acquire_binding(
        &self,
        binding: &BundleBinding,
    ) -> CoreResult<(AcquiredBundle, BundleManifest)> {
        let bundles = self.deps.bundles.as_ref().ok_or_else(|| {
            CoreError::new(ErrorKind::BundleNotFound, "bundle registry not configured")
        })?;
        let cache = self.deps.bundle_cache.as_ref().ok_or_else(|| {
            CoreError::new(ErrorKind::AcquireFailed, "bundle cache not configured")
        })?;

        let version = bundles
            .resolve_version(&binding.slug, &binding.version)
            .await?;
        let manifest = version.parsed_manifest()?;
        let acquired = cache.acquire(&version).await?;
        Ok((acquired, manifest))
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    async fn complete_success(
        &self,
        run: &JobRun,
        telemetry: Telemetry,
        mut extra_context: serde_json::Value,
    ) -> CoreResult<()> {
        // Handlers may return a `{result, metrics, context}` envelope.
        let (result, metrics_patch, context_patch) = split_result_envelope(telemetry.result);

        let mut metrics = serde_json::json!({
            "durationMs": telemetry.duration_ms,
            "resourceUsage": telemetry.resource_usage,
            "truncatedLogCount": telemetry.truncated_log_count,
        });
        if let (Some(m), Some(patch)) = (metrics.as_object_mut(), metrics_patch.as_object()) {
            for (k, v) in patch {
                m.insert(k.clone(), v.clone());
            }
        }

        if let Some(ctx_obj) = extra_context.as_object_mut() {
            if let Some(patch) = context_patch.as_object() {
                for (k, v) in patch {
                    ctx_obj.insert(k.clone(), v.clone());
                }
            }
            if !telemetry.logs.is_empty() {
                let tail: Vec<_> = telemetry
                    .logs
                    .iter()
                    .rev()
                    .take(100)
                    .rev()
                    .cloned()
                    .collect();
                ctx_obj.insert("logs".to_string(), serde_json::to_value(tail)?);
            }
        }

        self.complete(
            RunCompletion {
                run_id: run.id,
                status: RunStatus::Succeeded,
                result,
                error_message: None,
                failure_reason: None,
                metrics_patch: metrics,
                context_patch: extra_context,
            },
            "succeeded",
        )
        .await?;
        Ok(())
    }

    async fn handle_failure(
        self: &Arc<Self>,
        definition: &JobDefinition,
        run: &JobRun,
        err: CoreError,
    ) -> CoreResult<()> {
        let mut context_patch = serde_json::json!({});

        // Structured failure context blocks.
        if let Some(docker) = err.property("docker") {
            context_patch["docker"] = docker.clone();
        }
        if err.property("code") == Some(&serde_json::json!("asset_missing")) {
            context_patch["assetRecovery"] = serde_json::json!({
                "requested": true,
                "properties": err.properties,
            });
        }

        match err.kind {
            ErrorKind::Cancelled => {
                // The cancel endpoint usually settled the row already; this
                // covers sandbox-observed cancellation.
                self.deps.store.cancel_run(run.id, &err.message).await?;
                Ok(())
            }
            ErrorKind::Timeout => {
                if self.maybe_retry(definition, run, "timeout").await? {
                    return Ok(());
                }
                self.complete(
                    RunCompletion {
                        run_id: run.id,
                        status: RunStatus::Expired,
                        result: None,
                        error_message: Some(err.message.clone()),
                        failure_reason: Some("timeout".to_string()),
                        metrics_patch: serde_json::json!({}),
                        context_patch,
                    },
                    "expired",
                )
                .await?;
                Ok(())
            }
            kind if kind.is_retryable() => {
                if self.maybe_retry(definition, run, kind.as_str()).await? {
                    return Ok(());
                }
                self.complete(
                    RunCompletion::failed(run.id, kind.as_str(), &err.message)
                        .with_context(context_patch),
                    "failed",
                )
                .await?;
                Ok(())
            }
            kind => {
                // Terminal: policy violations, validation, missing bundles
                // after recovery, corrupt artifacts.
                self.complete(
                    RunCompletion::failed(run.id, kind.as_str(), &err.message)
                        .with_context(context_patch),
                    "failed",
                )
                .await?;
                Ok(())
            }
        }
    }

    /// Requeue per retry policy. Returns true when another attempt was
    /// scheduled.
    async fn maybe_retry(
        self: &Arc<Self>,
        definition: &JobDefinition,
        run: &JobRun,
        reason: &str,
    ) -> CoreResult<bool> {
        let policy = definition.parsed_retry_policy();
        if !retry::attempts_remain(&policy, run.attempt, run.max_attempts) {
            return Ok(false);
        }
        let delay = retry::next_delay(&policy, run.attempt);
        self.deps.store.requeue_run(run.id, reason, delay).await?;
        self.enqueue_dispatch(run.id, delay).await?;
        info!(
            run_id = %run.id,
            slug = %definition.slug,
            attempt = run.attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "run requeued for retry"
        );
        Ok(true)
    }

    async fn complete(&self, completion: RunCompletion, label: &str) -> CoreResult<JobRun> {
        let run = self.deps.store.complete_run(completion).await?;
        self.deps
            .metrics
            .job_runs_completed
            .with_label_values(&[label])
            .inc();
        Ok(run)
    }

    // ------------------------------------------------------------------
    // Repository-special jobs
    // ------------------------------------------------------------------

    async fn execute_repository_job(
        self: &Arc<Self>,
        definition: &JobDefinition,
        run: &JobRun,
    ) -> CoreResult<()> {
        let Some(run) = self.deps.store.try_start_run(run.id).await? else {
            return Ok(());
        };
        let parameters = run.effective_parameters(definition);

        let payload = if definition.slug == REPOSITORY_INGEST_SLUG {
            let Some(repository_id) = parameters.get("repositoryId").and_then(|v| v.as_str())
            else {
                self.complete(
                    RunCompletion::failed(run.id, "missing-parameter", "repositoryId is required"),
                    "failed",
                )
                .await?;
                return Ok(());
            };
            serde_json::json!({"kind": "ingest", "repositoryId": repository_id})
        } else {
            let Some(build_id) = parameters.get("buildId").and_then(|v| v.as_str()) else {
                self.complete(
                    RunCompletion::failed(run.id, "missing-parameter", "buildId is required"),
                    "failed",
                )
                .await?;
                return Ok(());
            };
            // repositoryId is explicit or derivable from the build id prefix.
            let repository_id = parameters
                .get("repositoryId")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| build_id.split(':').next().map(str::to_string));
            let Some(repository_id) = repository_id.filter(|s| !s.is_empty()) else {
                self.complete(
                    RunCompletion::failed(
                        run.id,
                        "missing-parameter",
                        "repositoryId is required and not derivable from buildId",
                    ),
                    "failed",
                )
                .await?;
                return Ok(());
            };
            serde_json::json!({
                "kind": "build",
                "buildId": build_id,
                "repositoryId": repository_id,
            })
        };

        let queue_job_id = self
            .deps
            .queue
            .enqueue(
                names::REPOSITORY,
                payload,
                EnqueueOptions {
                    job_id: Some(format!("repo-run-{}", run.id)),
                    ..Default::default()
                },
            )
            .await?;

        self.complete(
            RunCompletion::succeeded(
                run.id,
                Some(serde_json::json!({"enqueued": queue_job_id})),
            )
            .with_context(serde_json::json!({
                "repositoryEnqueue": {"queue": names::REPOSITORY, "jobId": queue_job_id}
            })),
            "succeeded",
        )
        .await?;
        Ok(())
    }
}

/// Split a handler result envelope into `(result, metrics, context)`.
fn split_result_envelope(
    value: Option<serde_json::Value>,
) -> (
    Option<serde_json::Value>,
    serde_json::Value,
    serde_json::Value,
) {
    let Some(value) = value else {
        return (None, serde_json::json!({}), serde_json::json!({}));
    };
    let Some(obj) = value.as_object() else {
        return (Some(value), serde_json::json!({}), serde_json::json!({}));
    };
    let is_envelope = obj.contains_key("result")
        && obj.keys().all(|k| matches!(k.as_str(), "result" | "metrics" | "context"));
    if !is_envelope {
        return (Some(value), serde_json::json!({}), serde_json::json!({}));
    }
    let result = obj.get("result").cloned();
    let metrics = obj.get("metrics").cloned().unwrap_or(serde_json::json!({}));
    let context = obj.get("context").cloned().unwrap_or(serde_json::json!({}));
    (result, metrics, context)
}

/// Consumer for the repository-special queue. The actual repository service
/// lives outside this process; this relay records deliveries so inline
/// deployments drain the queue.
pub struct RepositoryRelayHandler;

#[async_trait]
impl QueueHandler for RepositoryRelayHandler {
    async fn handle(&self, job: JobEnvelope) -> CoreResult<()> {
        info!(
            job_id = %job.job_id,
            kind = %job.payload.get("kind").and_then(|v| v.as_str()).unwrap_or("unknown"),
            "repository job relayed"
        );
        Ok(())
    }
}

/// Queue-facing dispatch handler.
pub struct RunDispatchHandler {
    runtime: Arc<JobRuntime>,
}

impl RunDispatchHandler {
    pub fn new(runtime: Arc<JobRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl QueueHandler for RunDispatchHandler {
    async fn handle(&self, job: JobEnvelope) -> CoreResult<()> {
        let dispatch: RunDispatch = serde_json::from_value(job.payload)?;
        self.runtime.execute_run(dispatch.run_id).await
    }
}

#[cfg(test)]
mod tests;
