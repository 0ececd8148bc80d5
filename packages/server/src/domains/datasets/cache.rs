//! Manifest cache.
//!
//! Mirrors the latest published manifest per `(dataset, shard)` lane. Writers
//! invalidate through the bus after commit; misses fall through to the
//! metadata store. The in-memory implementation doubles as the "remote
//! cache" seam: deployments with a cache service implement the same trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::model::{DatasetManifest, DatasetPartition};
use crate::kernel::invalidation::InvalidationBus;

/// A cached manifest with its partition set.
#[derive(Debug, Clone)]
pub struct CachedManifest {
    pub manifest: DatasetManifest,
    pub partitions: Vec<DatasetPartition>,
}

#[async_trait]
pub trait ManifestCache: Send + Sync {
    async fn get_latest_published(&self, dataset_id: Uuid, shard: &str)
        -> Option<CachedManifest>;
    async fn put(&self, entry: CachedManifest);
    async fn invalidate_shard(&self, dataset_id: Uuid, shard: &str);
    async fn invalidate_dataset(&self, dataset_id: Uuid);
}

#[derive(Default)]
pub struct InMemoryManifestCache {
    entries: Mutex<HashMap<(Uuid, String), CachedManifest>>,
}

impl InMemoryManifestCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe this cache to the invalidation bus. Runs until the bus is
    /// dropped.
    pub fn attach(self: &Arc<Self>, bus: &InvalidationBus) {
        let cache = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event.manifest_shard {
                    Some(shard) => cache.invalidate_shard(event.dataset_id, &shard).await,
                    None => cache.invalidate_dataset(event.dataset_id).await,
                }
            }
        });
    }
}

#[async_trait]
impl ManifestCache for InMemoryManifestCache {
    async fn get_latest_published(
        &self,
        dataset_id: Uuid,
        shard: &str,
    ) -> Option<CachedManifest> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(dataset_id, shard.to_string()))
            .cloned()
    }

    async fn put(&self, entry: CachedManifest) {
        let key = (
            entry.manifest.dataset_id,
            entry.manifest.manifest_shard.clone(),
        );
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, entry);
    }

    async fn invalidate_shard(&self, dataset_id: Uuid, shard: &str) {
        debug!(dataset_id = %dataset_id, shard, "manifest cache shard invalidated");
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(dataset_id, shard.to_string()));
    }

    async fn invalidate_dataset(&self, dataset_id: Uuid) {
        debug!(dataset_id = %dataset_id, "manifest cache dataset invalidated");
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _), _| *id != dataset_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::db_id;
    use crate::domains::datasets::model::ManifestStatus;
    use chrono::Utc;

    fn entry(dataset_id: Uuid, shard: &str, version: i32) -> CachedManifest {
        CachedManifest {
            manifest: DatasetManifest {
                id: db_id(),
                dataset_id,
                version,
                status: ManifestStatus::Published,
                schema_version_id: None,
                parent_manifest_id: None,
                manifest_shard: shard.to_string(),
                summary: serde_json::json!({}),
                statistics: serde_json::json!({}),
                partition_count: 0,
                total_rows: 0,
                total_bytes: 0,
                created_by: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                published_at: Some(Utc::now()),
            },
            partitions: vec![],
        }
    }

    #[tokio::test]
    async fn put_get_invalidate() {
        let cache = InMemoryManifestCache::new();
        let dataset = db_id();

        cache.put(entry(dataset, "default", 1)).await;
        cache.put(entry(dataset, "other", 1)).await;
        assert!(cache.get_latest_published(dataset, "default").await.is_some());

        cache.invalidate_shard(dataset, "default").await;
        assert!(cache.get_latest_published(dataset, "default").await.is_none());
        assert!(cache.get_latest_published(dataset, "other").await.is_some());

        cache.invalidate_dataset(dataset).await;
        assert!(cache.get_latest_published(dataset, "other").await.is_none());
    }

    #[tokio::test]
    async fn bus_events_invalidate_attached_cache() {
        let cache = InMemoryManifestCache::new();
        let bus = InvalidationBus::new();
        cache.attach(&bus);

        let dataset = db_id();
        cache.put(entry(dataset, "default", 1)).await;

        bus.publish_shard(dataset, "default");
        // Give the subscriber task a beat.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            if cache.get_latest_published(dataset, "default").await.is_none() {
                return;
            }
        }
        panic!("cache entry survived invalidation");
    }
}
