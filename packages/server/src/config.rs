//! Application configuration loaded from environment variables.

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;

/// Queue execution mode, selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Durable broker-backed queues; required when multiple workers exist.
    Distributed,
    /// Queue operations run synchronously on the calling thread.
    Inline,
}

/// Network modes a container run may request.
pub const NETWORK_MODES: &[&str] = &["none", "bridge"];

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub mode: QueueMode,
    pub allow_inline: bool,
}

#[derive(Debug, Clone)]
pub struct BundleConfig {
    pub enabled: bool,
    pub enable_slugs: Vec<String>,
    pub disable_slugs: Vec<String>,
    pub disable_fallback: bool,
    pub storage_dir: PathBuf,
    pub storage_backend: String,
    pub signing_secret: Option<String>,
    /// Extracted-bundle cache TTL in seconds.
    pub cache_ttl_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub enabled: bool,
    pub workspace_root: PathBuf,
    pub image_allowlist: Vec<String>,
    pub image_denylist: Vec<String>,
    pub max_workspace_bytes: Option<u64>,
    pub enable_gpu: bool,
    pub enforce_network_isolation: bool,
    pub allow_network_override: bool,
    pub allowed_network_modes: Vec<String>,
    pub default_network_mode: String,
    pub persist_log_tail: bool,
}

#[derive(Debug, Clone)]
pub struct TimestoreConfig {
    pub storage_root: PathBuf,
    pub storage_backend: String,
    pub s3_endpoint: Option<String>,
    pub s3_bucket: Option<String>,
    pub clickhouse_url: Option<String>,
    pub manifest_cache_url: Option<String>,
    pub lifecycle_interval_seconds: u64,
    pub lifecycle_jitter_seconds: u64,
    pub lifecycle_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct ScopeConfig {
    pub admin_scope: String,
    pub metrics_scope: Option<String>,
    pub default_scope: String,
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub queue: QueueConfig,
    pub bundles: BundleConfig,
    pub docker: DockerConfig,
    pub timestore: TimestoreConfig,
    pub scopes: ScopeConfig,
    /// Interpreter binary for the subprocess sandbox.
    pub interpreter_bin: String,
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let database_url = env::var("TIMESTORE_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("TIMESTORE_DATABASE_URL or DATABASE_URL must be set")?;

        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "inline".to_string());
        let allow_inline = env_bool("APPHUB_ALLOW_INLINE_MODE", false);
        let mode = if redis_url == "inline" {
            if !allow_inline {
                bail!("REDIS_URL=inline requires APPHUB_ALLOW_INLINE_MODE=1");
            }
            QueueMode::Inline
        } else {
            QueueMode::Distributed
        };

        let allowed_network_modes = {
            let modes = env_list("CORE_DOCKER_ALLOWED_NETWORK_MODES");
            let modes = if modes.is_empty() {
                vec!["none".to_string()]
            } else {
                modes
            };
            for mode in &modes {
                if !NETWORK_MODES.contains(&mode.as_str()) {
                    bail!("CORE_DOCKER_ALLOWED_NETWORK_MODES: unknown mode {mode}");
                }
            }
            modes
        };

        let default_network_mode =
            env::var("CORE_DOCKER_DEFAULT_NETWORK_MODE").unwrap_or_else(|_| "none".to_string());
        if !NETWORK_MODES.contains(&default_network_mode.as_str()) {
            bail!("CORE_DOCKER_DEFAULT_NETWORK_MODE: unknown mode {default_network_mode}");
        }

        Ok(Self {
            database_url,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "4100".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            queue: QueueConfig {
                mode,
                allow_inline,
            },
            bundles: BundleConfig {
                enabled: env_bool("APPHUB_JOB_BUNDLES_ENABLED", true),
                enable_slugs: env_list("APPHUB_JOB_BUNDLES_ENABLE_SLUGS"),
                disable_slugs: env_list("APPHUB_JOB_BUNDLES_DISABLE_SLUGS"),
                disable_fallback: env_bool("APPHUB_JOB_BUNDLES_DISABLE_FALLBACK", false),
                storage_dir: env::var("APPHUB_JOB_BUNDLE_STORAGE_DIR")
                    .unwrap_or_else(|_| "./data/bundles".to_string())
                    .into(),
                storage_backend: env::var("APPHUB_JOB_BUNDLE_STORAGE_BACKEND")
                    .unwrap_or_else(|_| "filesystem".to_string()),
                signing_secret: env::var("APPHUB_JOB_BUNDLE_SIGNING_SECRET").ok(),
                cache_ttl_seconds: env_u64("APPHUB_JOB_BUNDLE_CACHE_TTL_SECONDS", 300)?,
            },
            docker: DockerConfig {
                enabled: env_bool("CORE_ENABLE_DOCKER_JOBS", false),
                workspace_root: env::var("CORE_DOCKER_WORKSPACE_ROOT")
                    .unwrap_or_else(|_| "./data/docker-workspaces".to_string())
                    .into(),
                image_allowlist: env_list("CORE_DOCKER_IMAGE_ALLOWLIST"),
                image_denylist: env_list("CORE_DOCKER_IMAGE_DENYLIST"),
                max_workspace_bytes: env::var("CORE_DOCKER_MAX_WORKSPACE_BYTES")
                    .ok()
                    .map(|v| v.parse().context("CORE_DOCKER_MAX_WORKSPACE_BYTES"))
                    .transpose()?,
                enable_gpu: env_bool("CORE_DOCKER_ENABLE_GPU", false),
                enforce_network_isolation: env_bool("CORE_DOCKER_ENFORCE_NETWORK_ISOLATION", true),
                allow_network_override: env_bool("CORE_DOCKER_ALLOW_NETWORK_OVERRIDE", false),
                allowed_network_modes,
                default_network_mode,
                persist_log_tail: env_bool("CORE_DOCKER_PERSIST_LOG_TAIL", false),
            },
            timestore: TimestoreConfig {
                storage_root: env::var("TIMESTORE_STORAGE_ROOT")
                    .unwrap_or_else(|_| "./data/timestore".to_string())
                    .into(),
                storage_backend: env::var("TIMESTORE_STORAGE_BACKEND")
                    .unwrap_or_else(|_| "local".to_string()),
                s3_endpoint: env::var("TIMESTORE_S3_ENDPOINT").ok(),
                s3_bucket: env::var("TIMESTORE_S3_BUCKET").ok(),
                clickhouse_url: env::var("TIMESTORE_CLICKHOUSE_URL").ok(),
                manifest_cache_url: env::var("TIMESTORE_MANIFEST_CACHE_URL").ok(),
                lifecycle_interval_seconds: env_u64("TIMESTORE_LIFECYCLE_INTERVAL_SECONDS", 300)?,
                lifecycle_jitter_seconds: env_u64("TIMESTORE_LIFECYCLE_JITTER_SECONDS", 30)?,
                lifecycle_concurrency: env_u64("TIMESTORE_LIFECYCLE_CONCURRENCY", 2)? as usize,
            },
            scopes: ScopeConfig {
                admin_scope: env::var("STRATA_ADMIN_SCOPE")
                    .unwrap_or_else(|_| "strata:admin".to_string()),
                metrics_scope: env::var("STRATA_METRICS_SCOPE").ok(),
                default_scope: env::var("STRATA_DEFAULT_SCOPE")
                    .unwrap_or_else(|_| "strata:default".to_string()),
            },
            interpreter_bin: env::var("STRATA_INTERPRETER_BIN")
                .unwrap_or_else(|_| "python3".to_string()),
        })
    }
}
