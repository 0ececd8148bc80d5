// Main entry point for the strata server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strata_core::config::{Config, QueueMode};
use strata_core::domains::columnar::{ClickHouseHttpDriver, ColumnarDriver};
use strata_core::domains::datasets::{InMemoryManifestCache, ManifestEngine, StorageTarget};
use strata_core::domains::filestore::FilestoreConsumer;
use strata_core::domains::ingest::{IngestJobHandler, IngestPipeline};
use strata_core::domains::lifecycle::{LifecycleConfig, LifecycleEngine, LifecycleJobHandler};
use strata_core::domains::query::{QueryExecutor, SqlNameCache};
use strata_core::kernel::bundles::{BundleCache, BundleRegistry, BundleStore};
use strata_core::kernel::invalidation::InvalidationBus;
use strata_core::kernel::metrics::Metrics;
use strata_core::kernel::queue::{names, InlineQueue, PostgresQueue, Queue};
use strata_core::kernel::runtime::store::PostgresJobStore;
use strata_core::kernel::runtime::{
    JobRuntime, ModuleTargetRegistry, NoRecovery, RepositoryRelayHandler, RunDispatchHandler,
    RuntimeDeps, StaticHandlerRegistry,
};
use strata_core::kernel::sandbox::{
    CliContainerDriver, ContainerExecutor, DockerPolicy, InterpreterSandbox, SandboxExecutor,
};
use strata_core::kernel::secrets::{EnvSecretResolver, SecretAccess};
use strata_core::kernel::storage::{FilesystemStorage, S3Storage, StorageDriver};
use strata_core::server::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,strata_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting strata server");

    let config = Config::from_env().context("failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("migrations complete");

    let metrics = Metrics::new().context("metrics registry")?;
    let bus = InvalidationBus::new();
    let shutdown = CancellationToken::new();

    // Storage drivers: one for partitions, one for bundle artifacts.
    let partition_storage: Arc<dyn StorageDriver> = match config.timestore.storage_backend.as_str()
    {
        "s3" => {
            let endpoint = config
                .timestore
                .s3_endpoint
                .clone()
                .context("TIMESTORE_S3_ENDPOINT required for s3 backend")?;
            let bucket = config
                .timestore
                .s3_bucket
                .clone()
                .context("TIMESTORE_S3_BUCKET required for s3 backend")?;
            Arc::new(S3Storage::new(endpoint, bucket))
        }
        _ => Arc::new(FilesystemStorage::new(&config.timestore.storage_root)),
    };
    let bundle_storage: Arc<dyn StorageDriver> = match config.bundles.storage_backend.as_str() {
        "s3" => {
            let endpoint = config
                .timestore
                .s3_endpoint
                .clone()
                .context("TIMESTORE_S3_ENDPOINT required for s3 bundle backend")?;
            let bucket = config
                .timestore
                .s3_bucket
                .clone()
                .context("TIMESTORE_S3_BUCKET required for s3 bundle backend")?;
            Arc::new(S3Storage::new(endpoint, bucket))
        }
        _ => Arc::new(FilesystemStorage::new(&config.bundles.storage_dir)),
    };

    let default_target = StorageTarget::ensure(
        "default",
        partition_storage.backend(),
        serde_json::json!({"root": config.timestore.storage_root}),
        &pool,
    )
    .await
    .context("storage target bootstrap")?;

    // Queue mode was validated at config load; inline requires the explicit
    // allow flag.
    let queue: Arc<dyn Queue> = match config.queue.mode {
        QueueMode::Inline => {
            tracing::warn!("queue running in inline mode");
            Arc::new(InlineQueue::new())
        }
        QueueMode::Distributed => Arc::new(PostgresQueue::new(pool.clone(), shutdown.clone())),
    };

    // Bundles.
    let bundle_registry = Arc::new(BundleRegistry::new(pool.clone(), bundle_storage));
    let bundle_cache = Arc::new(BundleCache::new(
        bundle_registry.store(),
        config.bundles.storage_dir.join("cache"),
        Duration::from_secs(config.bundles.cache_ttl_seconds),
    ));

    // Sandboxes.
    let interpreter: Arc<dyn SandboxExecutor> =
        Arc::new(InterpreterSandbox::new(config.interpreter_bin.clone()));
    let docker_policy = config
        .docker
        .enabled
        .then(|| DockerPolicy::from_config(&config.docker));
    let container: Option<Arc<dyn SandboxExecutor>> = docker_policy.as_ref().map(|policy| {
        Arc::new(ContainerExecutor::new(
            policy.clone(),
            config.docker.workspace_root.clone(),
            Arc::new(CliContainerDriver),
        )) as Arc<dyn SandboxExecutor>
    });

    // Job runtime.
    let secrets = Arc::new(SecretAccess::new(
        Arc::new(EnvSecretResolver),
        Some(pool.clone()),
    ));
    let runtime = JobRuntime::new(RuntimeDeps {
        store: Arc::new(PostgresJobStore::new(pool.clone())),
        queue: queue.clone(),
        bundles: Some(bundle_registry.clone() as Arc<dyn BundleStore>),
        bundle_cache: Some(bundle_cache),
        bundle_config: config.bundles.clone(),
        secrets,
        metrics: metrics.clone(),
        static_handlers: StaticHandlerRegistry::new(),
        module_targets: ModuleTargetRegistry::new(),
        recovery: Arc::new(NoRecovery),
        interpreter: Some(interpreter),
        container,
    });
    queue
        .register_worker(
            names::JOB_RUNS,
            4,
            Arc::new(RunDispatchHandler::new(runtime.clone())),
        )
        .await
        .context("job-run worker")?;
    queue
        .register_worker(names::REPOSITORY, 1, Arc::new(RepositoryRelayHandler))
        .await
        .context("repository worker")?;

    // Timestore.
    let manifest_engine = Arc::new(ManifestEngine::new(pool.clone(), bus.clone()));
    let manifest_cache = InMemoryManifestCache::new();
    manifest_cache.attach(&bus);
    let sql_cache = SqlNameCache::new();
    sql_cache.attach(&bus);

    let pipeline = Arc::new(IngestPipeline::new(
        pool.clone(),
        manifest_engine.clone(),
        partition_storage.clone(),
        default_target,
        metrics.clone(),
    ));
    queue
        .register_worker(
            names::INGEST,
            2,
            Arc::new(IngestJobHandler::new(pipeline.clone())),
        )
        .await
        .context("ingest worker")?;

    let columnar: Option<Arc<dyn ColumnarDriver>> = config
        .timestore
        .clickhouse_url
        .clone()
        .map(|url| Arc::new(ClickHouseHttpDriver::new(url)) as Arc<dyn ColumnarDriver>);

    let executor = Arc::new(QueryExecutor::new(
        pool.clone(),
        manifest_engine.clone(),
        manifest_cache,
        partition_storage.clone(),
        columnar.clone(),
        metrics.clone(),
    ));

    // Lifecycle: columnar-less deployments still compact and retain; the
    // migration op needs a real backend.
    let lifecycle_columnar: Arc<dyn ColumnarDriver> = columnar.clone().unwrap_or_else(|| {
        Arc::new(strata_core::domains::columnar::InMemoryColumnar::new())
    });
    let lifecycle = LifecycleEngine::new(
        pool.clone(),
        manifest_engine,
        partition_storage,
        lifecycle_columnar,
        metrics.clone(),
        LifecycleConfig {
            interval: Duration::from_secs(config.timestore.lifecycle_interval_seconds),
            jitter: Duration::from_secs(config.timestore.lifecycle_jitter_seconds),
            concurrency: config.timestore.lifecycle_concurrency,
            ..LifecycleConfig::default()
        },
    );
    queue
        .register_worker(
            names::LIFECYCLE,
            config.timestore.lifecycle_concurrency.max(1),
            Arc::new(LifecycleJobHandler::new(lifecycle.clone())),
        )
        .await
        .context("lifecycle worker")?;
    lifecycle.spawn_scheduler(queue.clone(), shutdown.clone());

    // Filestore consumer with the inline emitter.
    let (filestore_tx, filestore_rx) = tokio::sync::mpsc::channel(1024);
    FilestoreConsumer::new(pool.clone(), pipeline.clone()).spawn(filestore_rx, shutdown.clone());

    tracing::info!(
        default_scope = %config.scopes.default_scope,
        admin_scope = %config.scopes.admin_scope,
        "iam scopes configured"
    );

    let state = AppState {
        pool,
        queue,
        runtime,
        bundles: Some(bundle_registry),
        pipeline,
        executor,
        lifecycle,
        sql_cache,
        columnar,
        metrics,
        scopes: config.scopes.clone(),
        docker_policy,
        filestore: Some(filestore_tx),
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(addr = %addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind listen address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received, draining");
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    // Give worker pools a moment to drain in-flight jobs.
    tokio::time::sleep(Duration::from_millis(200)).await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(_) => {
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
