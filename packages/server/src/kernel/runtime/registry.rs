//! Static handler and module-target registries, plus the bundle recovery
//! hook and fallback gating.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::error::{CoreError, CoreResult};
use crate::config::BundleConfig;
use crate::kernel::bundles::BundleBinding;
use crate::kernel::sandbox::InprocEntry;

// ============================================================================
// Static handlers
// ============================================================================

/// Handlers compiled into the binary and registered at startup, keyed by
/// definition slug. Also used as the legacy fallback target when a bundle
/// cannot be recovered.
#[derive(Default)]
pub struct StaticHandlerRegistry {
    handlers: HashMap<String, Arc<dyn InprocEntry>>,
}

impl StaticHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, slug: &str, handler: Arc<dyn InprocEntry>) -> Self {
        self.handlers.insert(slug.to_string(), handler);
        self
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn InprocEntry>> {
        self.handlers.get(slug).cloned()
    }
}

// ============================================================================
// Module targets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleTargetKind {
    JobHandler,
    Service,
}

/// An in-process module target addressable from a `module:` entry point.
pub struct ModuleTarget {
    pub module_id: String,
    pub module_version: String,
    pub target_name: String,
    pub target_version: String,
    pub kind: ModuleTargetKind,
    pub enabled: bool,
    pub handler: Arc<dyn InprocEntry>,
}

#[derive(Default)]
pub struct ModuleTargetRegistry {
    targets: Vec<ModuleTarget>,
}

/// Parsed `module:<module>@<version>#<target>@<targetVersion>` entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleBinding {
    pub module_id: String,
    pub module_version: String,
    pub target_name: String,
    pub target_version: String,
}

impl ModuleBinding {
    pub fn parse(entry_point: &str) -> CoreResult<Self> {
        let rest = entry_point.strip_prefix("module:").ok_or_else(|| {
            CoreError::validation(format!("not a module entry point: {entry_point}"))
        })?;
        let (module, target) = rest.split_once('#').ok_or_else(|| {
            CoreError::validation(format!("module entry point missing target: {entry_point}"))
        })?;
        let (module_id, module_version) = module.split_once('@').ok_or_else(|| {
            CoreError::validation(format!("module entry point missing version: {entry_point}"))
        })?;
        let (target_name, target_version) = target.split_once('@').ok_or_else(|| {
            CoreError::validation(format!(
                "module entry point missing target version: {entry_point}"
            ))
        })?;
        if [module_id, module_version, target_name, target_version]
            .iter()
            .any(|s| s.is_empty())
        {
            return Err(CoreError::validation(format!(
                "malformed module entry point: {entry_point}"
            )));
        }
        Ok(Self {
            module_id: module_id.to_string(),
            module_version: module_version.to_string(),
            target_name: target_name.to_string(),
            target_version: target_version.to_string(),
        })
    }
}

impl ModuleTargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, target: ModuleTarget) -> Self {
        self.targets.push(target);
        self
    }

    /// Resolve a binding. Disabled modules and non-handler targets are
    /// rejected, not silently skipped.
    pub fn resolve(&self, binding: &ModuleBinding) -> CoreResult<Arc<dyn InprocEntry>> {
        let target = self
            .targets
            .iter()
            .find(|t| {
                t.module_id == binding.module_id
                    && t.module_version == binding.module_version
                    && t.target_name == binding.target_name
                    && t.target_version == binding.target_version
            })
            .ok_or_else(|| {
                CoreError::not_found(format!(
                    "module target {}@{}#{}@{} not registered",
                    binding.module_id,
                    binding.module_version,
                    binding.target_name,
                    binding.target_version
                ))
            })?;
        if !target.enabled {
            return Err(CoreError::validation(format!(
                "module {} is disabled",
                binding.module_id
            )));
        }
        if target.kind != ModuleTargetKind::JobHandler {
            return Err(CoreError::validation(format!(
                "module target {} is not a job handler",
                binding.target_name
            )));
        }
        Ok(target.handler.clone())
    }
}

// ============================================================================
// Bundle gating and recovery
// ============================================================================

/// Per-slug bundle enablement. Deny wins, then per-slug allow, then the
/// global flag.
pub fn bundles_enabled_for(config: &BundleConfig, slug: &str) -> bool {
    if config.disable_slugs.iter().any(|s| s == slug) {
        return false;
    }
    if config.enable_slugs.iter().any(|s| s == slug) {
        return true;
    }
    config.enabled
}

/// Whether the legacy static fallback may run for a slug after recovery
/// fails.
pub fn fallback_allowed_for(config: &BundleConfig, slug: &str) -> bool {
    if config.disable_fallback {
        return false;
    }
    // A slug with bundles explicitly disabled runs statically anyway; the
    // fallback question only arises for bundle-enabled slugs.
    bundles_enabled_for(config, slug)
}

/// Recovery hook: attempt to rematerialize a missing bundle from secondary
/// metadata. Returning a different binding redirects the dispatch.
#[async_trait]
pub trait BundleRecovery: Send + Sync {
    async fn recover(&self, binding: &BundleBinding) -> CoreResult<Option<BundleBinding>>;
}

/// Default hook: no recovery.
pub struct NoRecovery;

#[async_trait]
impl BundleRecovery for NoRecovery {
    async fn recover(&self, _binding: &BundleBinding) -> CoreResult<Option<BundleBinding>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn bundle_config() -> BundleConfig {
        BundleConfig {
            enabled: true,
            enable_slugs: vec!["explicitly-on".to_string()],
            disable_slugs: vec!["explicitly-off".to_string()],
            disable_fallback: false,
            storage_dir: PathBuf::from("/tmp"),
            storage_backend: "filesystem".to_string(),
            signing_secret: None,
            cache_ttl_seconds: 60,
        }
    }

    #[test]
    fn module_binding_parses() {
        let binding = ModuleBinding::parse("module:observatory@1.4.0#ingest@2.0.0").unwrap();
        assert_eq!(binding.module_id, "observatory");
        assert_eq!(binding.module_version, "1.4.0");
        assert_eq!(binding.target_name, "ingest");
        assert_eq!(binding.target_version, "2.0.0");

        assert!(ModuleBinding::parse("module:observatory#ingest@1").is_err());
        assert!(ModuleBinding::parse("module:observatory@1.0.0").is_err());
        assert!(ModuleBinding::parse("handlers.echo").is_err());
    }

    #[test]
    fn per_slug_knobs_win_over_global() {
        let config = bundle_config();
        assert!(bundles_enabled_for(&config, "anything"));
        assert!(!bundles_enabled_for(&config, "explicitly-off"));
        assert!(bundles_enabled_for(&config, "explicitly-on"));

        let disabled_global = BundleConfig {
            enabled: false,
            ..bundle_config()
        };
        assert!(!bundles_enabled_for(&disabled_global, "anything"));
        assert!(bundles_enabled_for(&disabled_global, "explicitly-on"));
        assert!(!bundles_enabled_for(&disabled_global, "explicitly-off"));
    }

    #[test]
    fn fallback_gate() {
        let config = bundle_config();
        assert!(fallback_allowed_for(&config, "anything"));

        let no_fallback = BundleConfig {
            disable_fallback: true,
            ..bundle_config()
        };
        assert!(!fallback_allowed_for(&no_fallback, "anything"));
    }
}
