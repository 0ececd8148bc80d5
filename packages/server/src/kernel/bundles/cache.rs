//! Local bundle cache.
//!
//! `acquire` materializes a bundle version on disk, verifies its checksum and
//! hands out a refcounted handle to the extracted directory. Concurrent
//! acquisitions of the same fingerprint share one extraction; eviction waits
//! for the refcount to reach zero and the TTL to lapse.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::registry::BundleVersionRow;
use crate::common::error::{CoreError, CoreResult, ErrorKind};
use crate::kernel::storage::StorageDriver;

struct CacheSlot {
    dir: Option<PathBuf>,
    refcount: usize,
    idle_since: Option<Instant>,
}

struct CacheInner {
    /// Fingerprint → slot. The per-slot mutex serializes extraction; the map
    /// mutex is only held for lookups.
    slots: HashMap<String, Arc<Mutex<CacheSlot>>>,
}

pub struct BundleCache {
    store: Arc<dyn StorageDriver>,
    cache_dir: PathBuf,
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

/// Handle to an extracted bundle directory. Callers must `release()` when
/// done; the directory stays valid until then.
pub struct AcquiredBundle {
    pub slug: String,
    pub version: String,
    pub checksum: String,
    pub dir: PathBuf,
    fingerprint: String,
    cache: Arc<BundleCache>,
}

impl std::fmt::Debug for AcquiredBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredBundle")
            .field("slug", &self.slug)
            .field("version", &self.version)
            .field("checksum", &self.checksum)
            .field("dir", &self.dir)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl AcquiredBundle {
    pub async fn release(self) {
        self.cache.release(&self.fingerprint).await;
    }
}

impl BundleCache {
    pub fn new(store: Arc<dyn StorageDriver>, cache_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            store,
            cache_dir: cache_dir.into(),
            ttl,
            inner: Mutex::new(CacheInner {
                slots: HashMap::new(),
            }),
        }
    }

    /// Materialize a bundle version, sharing extractions per fingerprint.
    pub async fn acquire(self: &Arc<Self>, version: &BundleVersionRow) -> CoreResult<AcquiredBundle> {
        self.evict_expired().await;

        let fingerprint = version.fingerprint();
        let slot = {
            let mut inner = self.inner.lock().await;
            inner
                .slots
                .entry(fingerprint.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(CacheSlot {
                        dir: None,
                        refcount: 0,
                        idle_since: None,
                    }))
                })
                .clone()
        };

        // Holding the slot lock across the download/extract is what makes
        // extraction at-most-once per fingerprint.
        let mut slot = slot.lock().await;
        if slot.dir.is_none() {
            let dir = self.materialize(version).await?;
            slot.dir = Some(dir);
        }
        slot.refcount += 1;
        slot.idle_since = None;

        Ok(AcquiredBundle {
            slug: version.bundle_slug.clone(),
            version: version.version.clone(),
            checksum: version.checksum.clone(),
            dir: slot.dir.clone().unwrap_or_default(),
            fingerprint,
            cache: self.clone(),
        })
    }

    async fn release(&self, fingerprint: &str) {
        let slot = {
            let inner = self.inner.lock().await;
            inner.slots.get(fingerprint).cloned()
        };
        if let Some(slot) = slot {
            let mut slot = slot.lock().await;
            slot.refcount = slot.refcount.saturating_sub(1);
            if slot.refcount == 0 {
                slot.idle_since = Some(Instant::now());
            }
        }
    }

    /// Drop extracted directories whose refcount is zero and whose TTL has
    /// lapsed. Called opportunistically from `acquire`.
    pub async fn evict_expired(&self) {
        let candidates: Vec<(String, Arc<Mutex<CacheSlot>>)> = {
            let inner = self.inner.lock().await;
            inner
                .slots
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        for (fingerprint, slot) in candidates {
            let dir = {
                let mut slot = slot.lock().await;
                match (slot.refcount, slot.idle_since) {
                    (0, Some(idle)) if idle.elapsed() >= self.ttl => slot.dir.take(),
                    _ => None,
                }
            };
            if let Some(dir) = dir {
                debug!(fingerprint = %fingerprint, "evicting cached bundle");
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    warn!(dir = %dir.display(), error = %e, "bundle eviction failed");
                }
                let mut inner = self.inner.lock().await;
                inner.slots.remove(&fingerprint);
            }
        }
    }

    /// Download, verify, and extract. A checksum mismatch gets one fresh
    /// download before surfacing `bundle-corrupt`.
    async fn materialize(&self, version: &BundleVersionRow) -> CoreResult<PathBuf> {
        let mut archive = self.download(version).await?;
        if !Self::checksum_matches(&archive, &version.checksum) {
            warn!(
                slug = %version.bundle_slug,
                version = %version.version,
                "bundle checksum mismatch, retrying download"
            );
            archive = self.download(version).await?;
            if !Self::checksum_matches(&archive, &version.checksum) {
                return Err(CoreError::new(
                    ErrorKind::BundleCorrupt,
                    format!(
                        "bundle {}@{} failed checksum verification",
                        version.bundle_slug, version.version
                    ),
                )
                .with_property("checksum", serde_json::json!(version.checksum)));
            }
        }

        let target = self.cache_dir.join(&version.checksum);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(target);
        }

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| CoreError::unavailable(format!("cache dir: {e}")))?;

        // Extract into a staging directory, then rename into place so readers
        // never observe a partial tree.
        let staging = tempfile::tempdir_in(&self.cache_dir)
            .map_err(|e| CoreError::unavailable(format!("cache staging: {e}")))?;
        let staging_path = staging.path().to_path_buf();
        let archive_for_blocking = archive.clone();
        tokio::task::spawn_blocking(move || -> CoreResult<()> {
            let decoder = flate2::read::GzDecoder::new(&archive_for_blocking[..]);
            let mut tar = tar::Archive::new(decoder);
            tar.unpack(&staging_path)
                .map_err(|e| CoreError::new(ErrorKind::BundleCorrupt, format!("unpack: {e}")))
        })
        .await
        .map_err(|e| CoreError::execution(format!("extract task: {e}")))??;

        let staging_path = staging.keep();
        match tokio::fs::rename(&staging_path, &target).await {
            Ok(()) => {}
            Err(_) if tokio::fs::try_exists(&target).await.unwrap_or(false) => {
                // Another process won the rename; ours is redundant.
                let _ = tokio::fs::remove_dir_all(&staging_path).await;
            }
            Err(e) => {
                return Err(CoreError::unavailable(format!(
                    "cache rename {}: {e}",
                    target.display()
                )))
            }
        }
        Ok(target)
    }

    async fn download(&self, version: &BundleVersionRow) -> CoreResult<Bytes> {
        self.store
            .get(&version.artifact_path)
            .await
            .map_err(|e| match e.kind {
                ErrorKind::NotFound => CoreError::new(
                    ErrorKind::BundleNotFound,
                    format!(
                        "artifact missing for {}@{}",
                        version.bundle_slug, version.version
                    ),
                ),
                ErrorKind::Unavailable => CoreError::new(
                    ErrorKind::AcquireFailed,
                    format!(
                        "artifact fetch failed for {}@{}: {}",
                        version.bundle_slug, version.version, e.message
                    ),
                ),
                _ => e,
            })
    }

    fn checksum_matches(archive: &Bytes, expected: &str) -> bool {
        hex::encode(Sha256::digest(archive)) == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::db_id;
    use crate::kernel::bundles::registry::pack_archive;
    use crate::kernel::storage::FilesystemStorage;
    use chrono::Utc;

    fn version_row(checksum: &str, path: &str) -> BundleVersionRow {
        BundleVersionRow {
            id: db_id(),
            bundle_slug: "echo".to_string(),
            version: "1.0.0".to_string(),
            manifest: serde_json::json!({}),
            checksum: checksum.to_string(),
            capability_flags: vec![],
            artifact_storage: "filesystem".to_string(),
            artifact_path: path.to_string(),
            artifact_size: 0,
            immutable: true,
            status: "published".to_string(),
            published_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn seeded_cache() -> (Arc<BundleCache>, BundleVersionRow, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FilesystemStorage::new(dir.path().join("store")));
        let archive = pack_archive(&[("manifest.json", b"{}" as &[u8]), ("entry.py", b"print(1)")])
            .unwrap();
        let checksum = hex::encode(Sha256::digest(&archive));
        let key = format!("bundles/{}/{}.tgz", &checksum[..2], checksum);
        store.put(&key, archive).await.unwrap();

        let cache = Arc::new(BundleCache::new(
            store,
            dir.path().join("cache"),
            Duration::from_millis(10),
        ));
        let row = version_row(&checksum, &key);
        (cache, row, dir)
    }

    #[tokio::test]
    async fn acquire_extracts_and_shares_directory() {
        let (cache, row, _dir) = seeded_cache().await;

        let a = cache.acquire(&row).await.unwrap();
        let b = cache.acquire(&row).await.unwrap();
        assert_eq!(a.dir, b.dir);
        assert!(a.dir.join("entry.py").exists());

        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn concurrent_acquires_extract_once() {
        let (cache, row, _dir) = seeded_cache().await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let row = row.clone();
                tokio::spawn(async move { cache.acquire(&row).await.unwrap().dir.clone() })
            })
            .collect();
        let mut dirs = Vec::new();
        for task in tasks {
            dirs.push(task.await.unwrap());
        }
        assert!(dirs.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn eviction_waits_for_release_and_ttl() {
        let (cache, row, _dir) = seeded_cache().await;

        let handle = cache.acquire(&row).await.unwrap();
        let dir = handle.dir.clone();

        // Held handle blocks eviction regardless of TTL.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.evict_expired().await;
        assert!(dir.exists());

        handle.release().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.evict_expired().await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn corrupt_artifact_surfaces_bundle_corrupt() {
        let (cache, mut row, _dir) = seeded_cache().await;
        row.checksum = "0".repeat(64);
        let err = cache.acquire(&row).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BundleCorrupt);
    }

    #[tokio::test]
    async fn missing_artifact_surfaces_bundle_not_found() {
        let (cache, mut row, _dir) = seeded_cache().await;
        row.artifact_path = "bundles/ff/feedbeef.tgz".to_string();
        let err = cache.acquire(&row).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BundleNotFound);
    }
}
