//! Typed invalidation bus.
//!
//! Writers that change manifest state publish `(dataset_id, manifest_shard)`
//! events after their transaction commits; subsystems holding derived caches
//! (manifest cache, SQL runtime cache) subscribe at startup. This replaces
//! recursive cross-subsystem invalidation calls.

use tokio::sync::broadcast;
use uuid::Uuid;

/// Cache invalidation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub dataset_id: Uuid,
    /// `None` invalidates every shard of the dataset.
    pub manifest_shard: Option<String>,
}

#[derive(Clone)]
pub struct InvalidationBus {
    tx: broadcast::Sender<Invalidation>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.tx.subscribe()
    }

    /// Publish after commit. Send failures only mean no subscriber is
    /// listening, which is fine at startup and in tests.
    pub fn publish_shard(&self, dataset_id: Uuid, manifest_shard: &str) {
        let _ = self.tx.send(Invalidation {
            dataset_id,
            manifest_shard: Some(manifest_shard.to_string()),
        });
    }

    pub fn publish_dataset(&self, dataset_id: Uuid) {
        let _ = self.tx.send(Invalidation {
            dataset_id,
            manifest_shard: None,
        });
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_shard_events() {
        let bus = InvalidationBus::new();
        let mut rx = bus.subscribe();
        let dataset_id = Uuid::now_v7();

        bus.publish_shard(dataset_id, "default");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.dataset_id, dataset_id);
        assert_eq!(event.manifest_shard.as_deref(), Some("default"));

        bus.publish_dataset(dataset_id);
        let event = rx.recv().await.unwrap();
        assert!(event.manifest_shard.is_none());
    }
}
