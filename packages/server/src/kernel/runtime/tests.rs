//! Runtime dispatch tests over the in-memory store and inline queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::Digest;

use super::model::*;
use super::registry::*;
use super::store::{InMemoryJobStore, JobStore};
use super::*;
use crate::common::error::{CoreError, CoreResult, ErrorKind};
use crate::config::BundleConfig;
use crate::kernel::bundles::{
    pack_archive, BundleBinding, BundleCache, BundleStore, BundleVersionRow,
};
use crate::kernel::queue::{InlineQueue, JobEnvelope, Queue, QueueHandler};
use crate::kernel::sandbox::{InprocEntry, RunContext, SandboxEnv};
use crate::kernel::secrets::{EnvSecretResolver, SecretAccess};
use crate::kernel::storage::{FilesystemStorage, StorageDriver};

struct Fixture {
    runtime: Arc<JobRuntime>,
    store: Arc<InMemoryJobStore>,
    queue: Arc<InlineQueue>,
    _tmp: Option<tempfile::TempDir>,
}

struct FixtureOptions {
    static_handlers: StaticHandlerRegistry,
    module_targets: ModuleTargetRegistry,
    bundles: Option<Arc<dyn BundleStore>>,
    bundle_cache: Option<Arc<BundleCache>>,
    recovery: Arc<dyn BundleRecovery>,
    bundle_config: BundleConfig,
    tmp: Option<tempfile::TempDir>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            static_handlers: StaticHandlerRegistry::new(),
            module_targets: ModuleTargetRegistry::new(),
            bundles: None,
            bundle_cache: None,
            recovery: Arc::new(NoRecovery),
            bundle_config: test_bundle_config(),
            tmp: None,
        }
    }
}

fn test_bundle_config() -> BundleConfig {
    BundleConfig {
        enabled: true,
        enable_slugs: vec![],
        disable_slugs: vec![],
        disable_fallback: false,
        storage_dir: std::path::PathBuf::from("/tmp"),
        storage_backend: "filesystem".to_string(),
        signing_secret: None,
        cache_ttl_seconds: 60,
    }
}

async fn fixture(options: FixtureOptions) -> Fixture {
    let store = Arc::new(InMemoryJobStore::new());
    let queue = Arc::new(InlineQueue::new());
    let runtime = JobRuntime::new(RuntimeDeps {
        store: store.clone(),
        queue: queue.clone(),
        bundles: options.bundles,
        bundle_cache: options.bundle_cache,
        bundle_config: options.bundle_config,
        secrets: Arc::new(SecretAccess::new(Arc::new(EnvSecretResolver), None)),
        metrics: crate::kernel::metrics::Metrics::new().unwrap(),
        static_handlers: options.static_handlers,
        module_targets: options.module_targets,
        recovery: options.recovery,
        interpreter: None,
        container: None,
    });
    queue
        .register_worker(
            crate::kernel::queue::names::JOB_RUNS,
            1,
            Arc::new(RunDispatchHandler::new(runtime.clone())),
        )
        .await
        .unwrap();
    Fixture {
        runtime,
        store,
        queue,
        _tmp: options.tmp,
    }
}

async fn define(
    fixture: &Fixture,
    slug: &str,
    runtime_kind: RuntimeKind,
    entry_point: &str,
) -> JobDefinition {
    fixture
        .store
        .upsert_definition(
            NewJobDefinition::builder()
                .slug(slug)
                .name(slug)
                .runtime(runtime_kind)
                .entry_point(entry_point)
                .build(),
        )
        .await
        .unwrap()
}

struct EchoHandler;

#[async_trait]
impl InprocEntry for EchoHandler {
    async fn run(
        &self,
        parameters: serde_json::Value,
        _env: Arc<SandboxEnv>,
        ctx: Arc<dyn RunContext>,
    ) -> CoreResult<serde_json::Value> {
        ctx.log("echo handler ran", None);
        Ok(serde_json::json!({
            "result": parameters,
            "metrics": {"rowsProcessed": 7},
            "context": {"stage": "done"},
        }))
    }
}

struct FlakyHandler {
    failures: AtomicUsize,
}

#[async_trait]
impl InprocEntry for FlakyHandler {
    async fn run(
        &self,
        _parameters: serde_json::Value,
        _env: Arc<SandboxEnv>,
        _ctx: Arc<dyn RunContext>,
    ) -> CoreResult<serde_json::Value> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::execution("transient failure"));
        }
        Ok(serde_json::json!({"ok": true}))
    }
}

struct SleepHandler;

#[async_trait]
impl InprocEntry for SleepHandler {
    async fn run(
        &self,
        _parameters: serde_json::Value,
        _env: Arc<SandboxEnv>,
        _ctx: Arc<dyn RunContext>,
    ) -> CoreResult<serde_json::Value> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(serde_json::json!({}))
    }
}

#[tokio::test]
async fn inline_run_succeeds_and_merges_envelope() {
    let fx = fixture(FixtureOptions {
        static_handlers: StaticHandlerRegistry::new().register("echo", Arc::new(EchoHandler)),
        ..Default::default()
    })
    .await;
    define(&fx, "echo", RuntimeKind::Inproc, "handlers.echo").await;

    let run = fx
        .runtime
        .trigger_run("echo", serde_json::json!({"v": 41}), serde_json::json!({}), None)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.result, Some(serde_json::json!({"v": 41})));
    assert_eq!(run.metrics["rowsProcessed"], 7);
    assert_eq!(run.context["stage"], "done");
    assert!(run.metrics["durationMs"].is_u64());
    assert!(run.started_at.is_some());
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn default_parameters_merge_under_submitted() {
    let fx = fixture(FixtureOptions {
        static_handlers: StaticHandlerRegistry::new().register("echo", Arc::new(EchoHandler)),
        ..Default::default()
    })
    .await;
    fx.store
        .upsert_definition(
            NewJobDefinition::builder()
                .slug("echo")
                .name("echo")
                .entry_point("handlers.echo")
                .default_parameters(serde_json::json!({"a": 1, "b": 2}))
                .build(),
        )
        .await
        .unwrap();

    let run = fx
        .runtime
        .trigger_run("echo", serde_json::json!({"b": 9}), serde_json::json!({}), None)
        .await
        .unwrap();
    assert_eq!(run.result, Some(serde_json::json!({"a": 1, "b": 9})));
}

#[tokio::test]
async fn missing_definition_is_not_found() {
    let fx = fixture(FixtureOptions::default()).await;
    let err = fx
        .runtime
        .trigger_run("ghost", serde_json::json!({}), serde_json::json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn retry_policy_reruns_until_success() {
    let fx = fixture(FixtureOptions {
        static_handlers: StaticHandlerRegistry::new().register(
            "flaky",
            Arc::new(FlakyHandler {
                failures: AtomicUsize::new(2),
            }),
        ),
        ..Default::default()
    })
    .await;
    fx.store
        .upsert_definition(
            NewJobDefinition::builder()
                .slug("flaky")
                .name("flaky")
                .entry_point("handlers.flaky")
                .retry_policy(RetryPolicy {
                    strategy: RetryStrategy::Fixed,
                    initial_delay_ms: 0,
                    max_delay_ms: None,
                    max_attempts: Some(5),
                    jitter_ratio: 0.0,
                })
                .build(),
        )
        .await
        .unwrap();

    let run = fx
        .runtime
        .trigger_run("flaky", serde_json::json!({}), serde_json::json!({}), None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.attempt, 3);
    assert_eq!(run.retry_count, 2);
}

#[tokio::test]
async fn exhausted_retries_fail_terminally() {
    let fx = fixture(FixtureOptions {
        static_handlers: StaticHandlerRegistry::new().register(
            "flaky",
            Arc::new(FlakyHandler {
                failures: AtomicUsize::new(10),
            }),
        ),
        ..Default::default()
    })
    .await;
    fx.store
        .upsert_definition(
            NewJobDefinition::builder()
                .slug("flaky")
                .name("flaky")
                .entry_point("handlers.flaky")
                .retry_policy(RetryPolicy {
                    strategy: RetryStrategy::Fixed,
                    initial_delay_ms: 0,
                    max_delay_ms: None,
                    max_attempts: Some(2),
                    jitter_ratio: 0.0,
                })
                .build(),
        )
        .await
        .unwrap();

    let run = fx
        .runtime
        .trigger_run("flaky", serde_json::json!({}), serde_json::json!({}), None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.attempt, 2);
    assert_eq!(run.failure_reason.as_deref(), Some("execution"));
}

#[tokio::test]
async fn timeout_without_retry_expires() {
    let fx = fixture(FixtureOptions {
        static_handlers: StaticHandlerRegistry::new().register("slow", Arc::new(SleepHandler)),
        ..Default::default()
    })
    .await;
    fx.store
        .upsert_definition(
            NewJobDefinition::builder()
                .slug("slow")
                .name("slow")
                .entry_point("handlers.slow")
                .timeout_ms(20i64)
                .build(),
        )
        .await
        .unwrap();

    let run = fx
        .runtime
        .trigger_run("slow", serde_json::json!({}), serde_json::json!({}), None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Expired);
    assert_eq!(run.failure_reason.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn cancel_during_execution_settles_canceled() {
    let fx = fixture(FixtureOptions {
        static_handlers: StaticHandlerRegistry::new().register("slow", Arc::new(SleepHandler)),
        ..Default::default()
    })
    .await;
    let def = define(&fx, "slow", RuntimeKind::Inproc, "handlers.slow").await;

    // Create the run directly and drive execute_run on a task so we can
    // cancel mid-flight.
    let run = fx
        .store
        .create_run(super::store::NewJobRun {
            definition_id: def.id,
            parameters: serde_json::json!({}),
            max_attempts: None,
            context: serde_json::json!({}),
        })
        .await
        .unwrap();

    let runtime = fx.runtime.clone();
    let run_id = run.id;
    let exec = tokio::spawn(async move { runtime.execute_run(run_id).await });

    // Wait until the run is actually running.
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if let Some(r) = fx.store.run(run_id).await.unwrap() {
            if r.status == RunStatus::Running {
                break;
            }
        }
    }

    fx.runtime
        .cancel_run(run_id, "operator requested stop")
        .await
        .unwrap()
        .expect("cancel should settle the run");
    exec.await.unwrap().unwrap();

    let settled = fx.store.run(run_id).await.unwrap().unwrap();
    assert_eq!(settled.status, RunStatus::Canceled);
    assert_eq!(settled.metrics["cancelledSteps"], 1);
    assert_eq!(
        settled.error_message.as_deref(),
        Some("operator requested stop")
    );

    // No further transitions after cancel acknowledgement.
    let after = fx
        .store
        .complete_run(super::store::RunCompletion::succeeded(run_id, None))
        .await
        .unwrap();
    assert_eq!(after.status, RunStatus::Canceled);
}

#[tokio::test]
async fn repository_ingest_requires_repository_id() {
    let fx = fixture(FixtureOptions::default()).await;
    define(&fx, "repository-ingest", RuntimeKind::Inproc, "internal.repository").await;

    let run = fx
        .runtime
        .trigger_run("repository-ingest", serde_json::json!({}), serde_json::json!({}), None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_reason.as_deref(), Some("missing-parameter"));
}

struct RecordingHandler {
    payloads: Mutex<Vec<serde_json::Value>>,
}

#[async_trait]
impl QueueHandler for RecordingHandler {
    async fn handle(&self, job: JobEnvelope) -> CoreResult<()> {
        self.payloads.lock().unwrap().push(job.payload);
        Ok(())
    }
}

#[tokio::test]
async fn repository_jobs_short_circuit_to_domain_queue() {
    let fx = fixture(FixtureOptions::default()).await;
    define(&fx, "repository-build", RuntimeKind::Inproc, "internal.repository").await;

    let recorder = Arc::new(RecordingHandler {
        payloads: Mutex::new(Vec::new()),
    });
    fx.queue
        .register_worker(crate::kernel::queue::names::REPOSITORY, 1, recorder.clone())
        .await
        .unwrap();

    let run = fx
        .runtime
        .trigger_run(
            "repository-build",
            serde_json::json!({"buildId": "repo-42:build-7"}),
            serde_json::json!({}),
            None,
        )
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.context["repositoryEnqueue"]["jobId"].is_string());

    let payloads = recorder.payloads.lock().unwrap();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["kind"], "build");
    assert_eq!(payloads[0]["repositoryId"], "repo-42");
}

#[tokio::test]
async fn module_targets_execute_in_process() {
    let fx = fixture(FixtureOptions {
        module_targets: ModuleTargetRegistry::new().register(ModuleTarget {
            module_id: "observatory".to_string(),
            module_version: "1.0.0".to_string(),
            target_name: "scan".to_string(),
            target_version: "2.0.0".to_string(),
            kind: ModuleTargetKind::JobHandler,
            enabled: true,
            handler: Arc::new(EchoHandler),
        }),
        ..Default::default()
    })
    .await;
    define(
        &fx,
        "observatory-scan",
        RuntimeKind::Module,
        "module:observatory@1.0.0#scan@2.0.0",
    )
    .await;

    let run = fx
        .runtime
        .trigger_run(
            "observatory-scan",
            serde_json::json!({"x": 1}),
            serde_json::json!({}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.result, Some(serde_json::json!({"x": 1})));
}

#[tokio::test]
async fn disabled_module_target_fails() {
    let fx = fixture(FixtureOptions {
        module_targets: ModuleTargetRegistry::new().register(ModuleTarget {
            module_id: "observatory".to_string(),
            module_version: "1.0.0".to_string(),
            target_name: "scan".to_string(),
            target_version: "2.0.0".to_string(),
            kind: ModuleTargetKind::JobHandler,
            enabled: false,
            handler: Arc::new(EchoHandler),
        }),
        ..Default::default()
    })
    .await;
    define(
        &fx,
        "observatory-scan",
        RuntimeKind::Module,
        "module:observatory@1.0.0#scan@2.0.0",
    )
    .await;

    let run = fx
        .runtime
        .trigger_run("observatory-scan", serde_json::json!({}), serde_json::json!({}), None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_reason.as_deref(), Some("validation"));
}

// ----------------------------------------------------------------------
// Bundle recovery (S5)
// ----------------------------------------------------------------------

/// Registry double: `echo@1.0.0` is missing (deleted out-of-band), the
/// recovered `echo@1.0.1` resolves to a real artifact.
struct PartialRegistry {
    good: BundleVersionRow,
}

#[async_trait]
impl BundleStore for PartialRegistry {
    async fn resolve_version(&self, slug: &str, version: &str) -> CoreResult<BundleVersionRow> {
        if slug == self.good.bundle_slug && version == self.good.version {
            Ok(self.good.clone())
        } else {
            Err(CoreError::new(
                ErrorKind::BundleNotFound,
                format!("bundle {slug}@{version} not found"),
            ))
        }
    }
}

struct RecoverToLatest;

#[async_trait]
impl BundleRecovery for RecoverToLatest {
    async fn recover(&self, binding: &BundleBinding) -> CoreResult<Option<BundleBinding>> {
        Ok(Some(BundleBinding {
            slug: binding.slug.clone(),
            version: "1.0.1".to_string(),
            export: binding.export.clone(),
        }))
    }
}

#[tokio::test]
async fn bundle_recovery_rematerializes_and_records_fallback() {
    let tmp = tempfile::tempdir().unwrap();
    let storage = Arc::new(FilesystemStorage::new(tmp.path().join("store")));
    let archive = pack_archive(&[("manifest.json", b"{}" as &[u8])]).unwrap();
    let checksum = hex::encode(sha2::Sha256::digest(&archive));
    let key = format!("bundles/{}/{}.tgz", &checksum[..2], checksum);
    storage.put(&key, archive).await.unwrap();

    let good = BundleVersionRow {
        id: crate::common::ids::db_id(),
        bundle_slug: "echo".to_string(),
        version: "1.0.1".to_string(),
        manifest: serde_json::json!({"runtime": "inproc"}),
        checksum,
        capability_flags: vec![],
        artifact_storage: "filesystem".to_string(),
        artifact_path: key,
        artifact_size: 0,
        immutable: true,
        status: "published".to_string(),
        published_by: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };

    let cache = Arc::new(BundleCache::new(
        storage,
        tmp.path().join("cache"),
        Duration::from_secs(60),
    ));

    let fx = fixture(FixtureOptions {
        static_handlers: StaticHandlerRegistry::new().register("echo", Arc::new(EchoHandler)),
        bundles: Some(Arc::new(PartialRegistry { good })),
        bundle_cache: Some(cache),
        recovery: Arc::new(RecoverToLatest),
        tmp: Some(tmp),
        ..Default::default()
    })
    .await;
    define(&fx, "echo", RuntimeKind::Inproc, "bundle:echo@1.0.0").await;

    let run = fx
        .runtime
        .trigger_run("echo", serde_json::json!({"v": 1}), serde_json::json!({}), None)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.context["bundleFallback"]["from"], "bundle:echo@1.0.0");
    assert_eq!(run.context["bundleFallback"]["to"], "bundle:echo@1.0.1");
}

#[tokio::test]
async fn failed_recovery_falls_back_to_static_handler() {
    let fx = fixture(FixtureOptions {
        static_handlers: StaticHandlerRegistry::new().register("echo", Arc::new(EchoHandler)),
        // No registry/cache configured: resolution always fails.
        ..Default::default()
    })
    .await;
    define(&fx, "echo", RuntimeKind::Inproc, "bundle:echo@1.0.0").await;

    let run = fx
        .runtime
        .trigger_run("echo", serde_json::json!({"v": 2}), serde_json::json!({}), None)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.context["bundleFallback"]["mode"], "static-handler");
}

#[tokio::test]
async fn disabled_fallback_surfaces_bundle_not_found() {
    let fx = fixture(FixtureOptions {
        static_handlers: StaticHandlerRegistry::new().register("echo", Arc::new(EchoHandler)),
        bundle_config: BundleConfig {
            disable_fallback: true,
            ..test_bundle_config()
        },
        ..Default::default()
    })
    .await;
    define(&fx, "echo", RuntimeKind::Inproc, "bundle:echo@1.0.0").await;

    let run = fx
        .runtime
        .trigger_run("echo", serde_json::json!({}), serde_json::json!({}), None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_reason.as_deref(), Some("bundle-not-found"));
}

#[tokio::test]
async fn context_bundle_override_wins_over_definition_binding() {
    let fx = fixture(FixtureOptions {
        static_handlers: StaticHandlerRegistry::new().register("echo", Arc::new(EchoHandler)),
        ..Default::default()
    })
    .await;
    define(&fx, "echo", RuntimeKind::Inproc, "bundle:echo@1.0.0").await;

    // Override points at a version that also cannot resolve; the static
    // fallback context records the *override* binding, proving it won.
    let run = fx
        .runtime
        .trigger_run(
            "echo",
            serde_json::json!({}),
            serde_json::json!({
                "bundleBinding": {"slug": "echo", "version": "9.9.9"}
            }),
            None,
        )
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.context["bundleFallback"]["from"], "bundle:echo@9.9.9");
    assert_eq!(run.context["bundleOverride"], true);
}

#[tokio::test]
async fn container_definition_violating_image_policy_is_rejected() {
    let fx = fixture(FixtureOptions::default()).await;
    let policy = crate::kernel::sandbox::DockerPolicy {
        image_allowlist: vec!["registry.example.com/*".to_string()],
        image_denylist: vec![],
        enable_gpu: false,
        network: crate::kernel::sandbox::NetworkPolicy {
            isolation_enabled: true,
            allow_mode_override: false,
            allowed_modes: vec!["none".to_string()],
            default_mode: "none".to_string(),
        },
    };

    let input = NewJobDefinition::builder()
        .slug("containerized")
        .name("containerized")
        .runtime(RuntimeKind::Container)
        .entry_point("container.run")
        .metadata(serde_json::json!({
            "docker": {"image": "other.registry/app:latest"}
        }))
        .build();

    let err = fx
        .runtime
        .validate_definition(&input, Some(&policy))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    let docker = err.property("docker").unwrap();
    assert!(docker["validationErrors"][0]
        .as_str()
        .unwrap()
        .contains("other.registry/app:latest"));

    // A compliant image passes.
    let ok = NewJobDefinition::builder()
        .slug("containerized")
        .name("containerized")
        .runtime(RuntimeKind::Container)
        .entry_point("container.run")
        .metadata(serde_json::json!({
            "docker": {"image": "registry.example.com/app:latest"}
        }))
        .build();
    fx.runtime.validate_definition(&ok, Some(&policy)).unwrap();
}
