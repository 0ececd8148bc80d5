//! Bundle registry and cache.
//!
//! A bundle is a gzipped tar archive holding a manifest plus the files a job
//! needs at execution time. Versions are content-addressed, immutable once
//! published, and materialized on demand into a refcounted local cache.

mod cache;
mod registry;

pub use cache::{AcquiredBundle, BundleCache};
pub use registry::{pack_archive, BundleRegistry, BundleVersionRow, PublishBundle};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::error::{CoreError, CoreResult};

/// Version lookup seam: the runtime resolves bundles through this trait so
/// tests can substitute a double for the registry.
#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn resolve_version(&self, slug: &str, version: &str) -> CoreResult<BundleVersionRow>;
}

#[async_trait]
impl BundleStore for BundleRegistry {
    async fn resolve_version(&self, slug: &str, version: &str) -> CoreResult<BundleVersionRow> {
        self.resolve(slug, version).await
    }
}

/// Parsed `bundle:<slug>@<version>[#export]` entry-point binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleBinding {
    pub slug: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
}

impl BundleBinding {
    /// Parse an entry point. Returns `None` when the entry point does not use
    /// the bundle scheme at all; malformed bundle entry points are errors.
    pub fn parse(entry_point: &str) -> CoreResult<Option<Self>> {
        let Some(rest) = entry_point.strip_prefix("bundle:") else {
            return Ok(None);
        };
        let (spec, export) = match rest.split_once('#') {
            Some((spec, export)) if !export.is_empty() => (spec, Some(export.to_string())),
            Some(_) => {
                return Err(CoreError::validation(format!(
                    "bundle entry point has empty export: {entry_point}"
                )))
            }
            None => (rest, None),
        };
        let Some((slug, version)) = spec.split_once('@') else {
            return Err(CoreError::validation(format!(
                "bundle entry point missing version: {entry_point}"
            )));
        };
        if slug.is_empty()
            || version.is_empty()
            || !slug
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::validation(format!(
                "invalid bundle binding: {entry_point}"
            )));
        }
        Ok(Some(Self {
            slug: slug.to_string(),
            version: version.to_string(),
            export,
        }))
    }

    pub fn fingerprint(&self, checksum: &str) -> String {
        format!("{}@{}:{}", self.slug, self.version, checksum)
    }
}

impl std::fmt::Display for BundleBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bundle:{}@{}", self.slug, self.version)?;
        if let Some(export) = &self.export {
            write!(f, "#{export}")?;
        }
        Ok(())
    }
}

/// Manifest JSON stored with every bundle version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleManifest {
    /// Entry file inside the archive.
    pub entry: String,
    /// Interpreter runtime the bundle targets (`inproc`, `interpreter`).
    pub runtime: String,
    /// Declared capability flags (`fs`, `net`, ...).
    pub capabilities: Vec<String>,
    /// Named exports callable from a binding.
    pub exports: Vec<String>,
}

impl BundleManifest {
    pub fn from_value(value: &serde_json::Value) -> CoreResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| CoreError::validation(format!("invalid bundle manifest: {e}")))
    }

    pub fn allows_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_binding() {
        let binding = BundleBinding::parse("bundle:echo@1.2.0#run").unwrap().unwrap();
        assert_eq!(binding.slug, "echo");
        assert_eq!(binding.version, "1.2.0");
        assert_eq!(binding.export.as_deref(), Some("run"));
        assert_eq!(binding.to_string(), "bundle:echo@1.2.0#run");
    }

    #[test]
    fn parses_binding_without_export() {
        let binding = BundleBinding::parse("bundle:echo@1.0.0").unwrap().unwrap();
        assert!(binding.export.is_none());
    }

    #[test]
    fn non_bundle_entry_points_pass_through() {
        assert!(BundleBinding::parse("handlers.echo").unwrap().is_none());
        assert!(BundleBinding::parse("module:observatory").unwrap().is_none());
    }

    #[test]
    fn malformed_bindings_are_rejected() {
        assert!(BundleBinding::parse("bundle:echo").is_err());
        assert!(BundleBinding::parse("bundle:@1.0.0").is_err());
        assert!(BundleBinding::parse("bundle:echo@1.0.0#").is_err());
        assert!(BundleBinding::parse("bundle:bad slug@1.0.0").is_err());
    }

    #[test]
    fn manifest_capability_check() {
        let manifest = BundleManifest {
            capabilities: vec!["fs".to_string()],
            ..Default::default()
        };
        assert!(manifest.allows_capability("fs"));
        assert!(!manifest.allows_capability("net"));
    }
}
