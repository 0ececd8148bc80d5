//! Filestore activity consumer.
//!
//! Subscribes to an external event channel (or the inline emitter used in
//! tests), updates the node-state table, and appends one row per event to a
//! fixed-schema dataset through the ingestion pipeline. A single consumer
//! worker per channel keeps per-node processing in receive order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::common::error::CoreResult;
use crate::domains::datasets::{FieldDef, FieldType, SchemaDef};
use crate::domains::ingest::{IngestPipeline, IngestRequest, PartitionSpec, TimeRange};

pub const FILESTORE_ACTIVITY_DATASET: &str = "filestore-activity";

/// One filesystem activity event from the external source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilestoreEvent {
    pub event_type: String,
    pub node_id: String,
    pub backend_mount_id: String,
    pub path: String,
    pub state: String,
    pub consistency_state: String,
    #[serde(default)]
    pub size_bytes: Option<i64>,
    #[serde(default)]
    pub size_delta: Option<i64>,
    #[serde(default)]
    pub journal_id: Option<i64>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub reconciliation_reason: Option<String>,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// The fixed schema of the activity dataset.
pub fn activity_schema() -> SchemaDef {
    let field = |name: &str, field_type: FieldType| FieldDef {
        name: name.to_string(),
        field_type,
    };
    SchemaDef {
        fields: vec![
            field("observed_at", FieldType::Timestamp),
            field("event_type", FieldType::String),
            field("node_id", FieldType::String),
            field("backend_mount_id", FieldType::String),
            field("path", FieldType::String),
            field("state", FieldType::String),
            field("consistency_state", FieldType::String),
            field("size_bytes", FieldType::Integer),
            field("size_delta", FieldType::Integer),
            field("journal_id", FieldType::Integer),
            field("command", FieldType::String),
            field("principal", FieldType::String),
            field("reconciliation_reason", FieldType::String),
            field("metadata_json", FieldType::String),
        ],
    }
}

impl FilestoreEvent {
    /// Project the event into an activity-dataset row.
    pub fn to_row(&self) -> serde_json::Value {
        serde_json::json!({
            "observed_at": self.observed_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            "event_type": self.event_type,
            "node_id": self.node_id,
            "backend_mount_id": self.backend_mount_id,
            "path": self.path,
            "state": self.state,
            "consistency_state": self.consistency_state,
            "size_bytes": self.size_bytes,
            "size_delta": self.size_delta,
            "journal_id": self.journal_id,
            "command": self.command,
            "principal": self.principal,
            "reconciliation_reason": self.reconciliation_reason,
            "metadata_json": self.metadata.to_string(),
        })
    }
}

pub struct FilestoreConsumer {
    pool: PgPool,
    pipeline: Arc<IngestPipeline>,
}

impl FilestoreConsumer {
    pub fn new(pool: PgPool, pipeline: Arc<IngestPipeline>) -> Arc<Self> {
        Arc::new(Self { pool, pipeline })
    }

    /// Run the single consumer worker until the channel closes or shutdown.
    pub fn spawn(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<FilestoreEvent>,
        shutdown: CancellationToken,
    ) {
        let consumer = self.clone();
        tokio::spawn(async move {
            info!("filestore consumer starting");
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) = consumer.handle(&event).await {
                    warn!(
                        node_id = %event.node_id,
                        event_type = %event.event_type,
                        error = %e,
                        "filestore event processing failed"
                    );
                }
            }
            info!("filestore consumer stopped");
        });
    }

    /// Process one event: node-state upsert, then an activity-dataset row.
    pub async fn handle(&self, event: &FilestoreEvent) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO filestore_nodes (
                node_id, backend_mount_id, path, state, consistency_state,
                size_bytes, last_journal_id, last_event_type, last_observed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (node_id) DO UPDATE SET
                backend_mount_id = EXCLUDED.backend_mount_id,
                path = EXCLUDED.path,
                state = EXCLUDED.state,
                consistency_state = EXCLUDED.consistency_state,
                size_bytes = EXCLUDED.size_bytes,
                last_journal_id = EXCLUDED.last_journal_id,
                last_event_type = EXCLUDED.last_event_type,
                last_observed_at = EXCLUDED.last_observed_at,
                updated_at = NOW()
            "#,
        )
        .bind(&event.node_id)
        .bind(&event.backend_mount_id)
        .bind(&event.path)
        .bind(&event.state)
        .bind(&event.consistency_state)
        .bind(event.size_bytes)
        .bind(event.journal_id)
        .bind(&event.event_type)
        .bind(event.observed_at)
        .execute(&self.pool)
        .await?;

        let idempotency_key = event
            .journal_id
            .map(|journal| format!("filestore:{}:{}", event.node_id, journal));

        let request = IngestRequest {
            schema: activity_schema(),
            partition: PartitionSpec {
                key: {
                    let mut key = serde_json::Map::new();
                    key.insert(
                        "date".to_string(),
                        serde_json::json!(event.observed_at.format("%Y-%m-%d").to_string()),
                    );
                    key
                },
                attributes: None,
                time_range: TimeRange {
                    start: event.observed_at,
                    end: event.observed_at,
                },
            },
            rows: vec![event.to_row()],
            idempotency_key,
            actor: Some("filestore-consumer".to_string()),
            storage_target_id: None,
            table_name: None,
        };

        self.pipeline
            .ingest(FILESTORE_ACTIVITY_DATASET, request)
            .await?;
        Ok(())
    }
}
