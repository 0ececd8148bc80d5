//! End-to-end timestore scenarios against a real Postgres.
//!
//! These tests need `DATABASE_URL` and are ignored by default:
//! `cargo test -- --ignored` with a migrated database runs them.

mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use strata_core::domains::datasets::{
    DatasetManifest, DatasetPartition, FieldDef, FieldType, InMemoryManifestCache, ManifestEngine,
    RetentionPolicy, RetentionRules, SchemaDef, StorageTarget,
};
use strata_core::domains::ingest::{IngestPipeline, IngestRequest, PartitionSpec, TimeRange};
use strata_core::domains::lifecycle::metrics::LifecycleMetrics;
use strata_core::domains::lifecycle::retention::run_retention;
use strata_core::domains::query::{QueryExecutor, QueryRequest};
use strata_core::kernel::invalidation::InvalidationBus;
use strata_core::kernel::metrics::Metrics;
use strata_core::kernel::storage::{FilesystemStorage, StorageDriver};

struct Harness {
    pool: sqlx::PgPool,
    pipeline: Arc<IngestPipeline>,
    executor: QueryExecutor,
    engine: Arc<ManifestEngine>,
    storage: Arc<FilesystemStorage>,
    metrics: Metrics,
    _tmp: tempfile::TempDir,
}

async fn harness() -> Harness {
    let pool = common::test_pool().await;
    let tmp = tempfile::tempdir().expect("tempdir");
    let storage = Arc::new(FilesystemStorage::new(tmp.path()));
    let bus = InvalidationBus::new();
    let engine = Arc::new(ManifestEngine::new(pool.clone(), bus.clone()));
    let metrics = Metrics::new().expect("metrics");
    let target = StorageTarget::ensure(
        &common::unique_slug("target"),
        "filesystem",
        serde_json::json!({}),
        &pool,
    )
    .await
    .expect("storage target");

    let pipeline = Arc::new(IngestPipeline::new(
        pool.clone(),
        engine.clone(),
        storage.clone() as Arc<dyn StorageDriver>,
        target,
        metrics.clone(),
    ));
    let cache = InMemoryManifestCache::new();
    cache.attach(&bus);
    let executor = QueryExecutor::new(
        pool.clone(),
        engine.clone(),
        cache,
        storage.clone() as Arc<dyn StorageDriver>,
        None,
        metrics.clone(),
    );

    Harness {
        pool,
        pipeline,
        executor,
        engine,
        storage,
        metrics,
        _tmp: tmp,
    }
}

fn demo_schema() -> SchemaDef {
    SchemaDef {
        fields: vec![
            FieldDef {
                name: "timestamp".to_string(),
                field_type: FieldType::Timestamp,
            },
            FieldDef {
                name: "v".to_string(),
                field_type: FieldType::Double,
            },
        ],
    }
}

fn demo_request(day: u32, idempotency_key: Option<&str>) -> IngestRequest {
    let start = Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 1, day, 23, 59, 59).unwrap();
    IngestRequest {
        schema: demo_schema(),
        partition: PartitionSpec {
            key: {
                let mut key = serde_json::Map::new();
                key.insert(
                    "date".to_string(),
                    serde_json::json!(format!("2024-01-{day:02}")),
                );
                key
            },
            attributes: None,
            time_range: TimeRange { start, end },
        },
        rows: vec![serde_json::json!({
            "timestamp": start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "v": 1.5,
        })],
        idempotency_key: idempotency_key.map(str::to_string),
        actor: Some("tests".to_string()),
        storage_target_id: None,
        table_name: None,
    }
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn inline_ingest_then_query_returns_the_row() {
    let h = harness().await;
    let slug = common::unique_slug("demo");

    let outcome = h.pipeline.ingest(&slug, demo_request(1, None)).await.unwrap();
    assert_eq!(outcome.manifest_version, Some(1));
    assert!(!outcome.deduplicated);

    let dataset = strata_core::domains::datasets::Dataset::require_by_slug(&slug, &h.pool)
        .await
        .unwrap();
    let response = h
        .executor
        .query(
            &dataset,
            QueryRequest {
                time_range: TimeRange {
                    start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                    end: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
                },
                timestamp_column: None,
                columns: None,
                filters: None,
                downsample: None,
                limit: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(response.mode, "raw");
    assert_eq!(response.rows.len(), 1);
    assert_eq!(response.rows[0]["v"], 1.5);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn manifest_singleton_holds_across_publications() {
    let h = harness().await;
    let slug = common::unique_slug("singleton");

    for day in 1..=3 {
        h.pipeline.ingest(&slug, demo_request(day, None)).await.unwrap();
    }

    let dataset = strata_core::domains::datasets::Dataset::require_by_slug(&slug, &h.pool)
        .await
        .unwrap();
    let published: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM dataset_manifests
        WHERE dataset_id = $1 AND manifest_shard = 'default' AND status = 'published'
        "#,
    )
    .bind(dataset.id)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(published, 1);

    // The published manifest carries all three partitions.
    let (manifest, partitions) = h
        .engine
        .latest_published(dataset.id, "default")
        .await
        .unwrap()
        .expect("published manifest");
    assert_eq!(manifest.version, 3);
    assert_eq!(partitions.len(), 3);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn idempotency_key_produces_at_most_one_partition() {
    let h = harness().await;
    let slug = common::unique_slug("idem");

    let first = h
        .pipeline
        .ingest(&slug, demo_request(1, Some("receipt-1")))
        .await
        .unwrap();
    let second = h
        .pipeline
        .ingest(&slug, demo_request(1, Some("receipt-1")))
        .await
        .unwrap();

    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.partition_id, second.partition_id);

    let dataset = strata_core::domains::datasets::Dataset::require_by_slug(&slug, &h.pool)
        .await
        .unwrap();
    let (_, partitions) = h
        .engine
        .latest_published(dataset.id, "default")
        .await
        .unwrap()
        .expect("published manifest");
    assert_eq!(partitions.len(), 1);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn retention_drops_aged_partition_and_audits() {
    let h = harness().await;
    let slug = common::unique_slug("retain");

    // An old partition (2024) is far past any age window measured from now.
    h.pipeline.ingest(&slug, demo_request(1, None)).await.unwrap();

    let dataset = strata_core::domains::datasets::Dataset::require_by_slug(&slug, &h.pool)
        .await
        .unwrap();
    let policy = RetentionPolicy::upsert(
        dataset.id,
        "time",
        &RetentionRules {
            max_age_hours: Some(1),
            max_total_bytes: None,
        },
        0,
        &h.pool,
    )
    .await
    .unwrap();

    let (manifest, partitions) = h
        .engine
        .latest_published(dataset.id, "default")
        .await
        .unwrap()
        .expect("published manifest");
    let dropped_path = partitions[0].file_path.clone();

    let lifecycle_metrics = LifecycleMetrics::new();
    let storage: Arc<dyn StorageDriver> = h.storage.clone();
    let outcome = run_retention(
        &dataset,
        &manifest,
        &partitions,
        &policy,
        &h.engine,
        &storage,
        &lifecycle_metrics,
        &h.metrics,
    )
    .await
    .unwrap();

    assert_eq!(outcome.partitions_dropped, 1);
    let new_manifest = outcome.manifest.expect("retention publishes");
    let remaining = DatasetPartition::for_manifest(new_manifest.id, &h.pool)
        .await
        .unwrap();
    assert!(remaining.is_empty());

    // Physical file is gone.
    assert!(h.storage.get(&dropped_path).await.is_err());

    // Audit entry exists.
    let drops: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM lifecycle_audit_log
        WHERE dataset_id = $1 AND event_type = 'retention.drop'
        "#,
    )
    .bind(dataset.id)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert!(drops >= 1);

    // Singleton invariant survives retention.
    let published = DatasetManifest::latest_published(dataset.id, "default", &h.pool)
        .await
        .unwrap()
        .expect("published manifest");
    assert_eq!(published.id, new_manifest.id);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn non_additive_schema_change_is_rejected() {
    let h = harness().await;
    let slug = common::unique_slug("schema");

    h.pipeline.ingest(&slug, demo_request(1, None)).await.unwrap();

    // Retype `v` double -> boolean: incompatible.
    let mut incompatible = demo_request(2, None);
    incompatible.schema.fields[1].field_type = FieldType::Boolean;
    incompatible.rows = vec![serde_json::json!({
        "timestamp": "2024-01-02T00:00:00Z",
        "v": true,
    })];
    let err = h.pipeline.ingest(&slug, incompatible).await.unwrap_err();
    assert_eq!(
        err.property("code"),
        Some(&serde_json::json!("schema-incompatible"))
    );

    // Adding a nullable field auto-upgrades the schema version.
    let mut additive = demo_request(3, None);
    additive.schema.fields.push(FieldDef {
        name: "region".to_string(),
        field_type: FieldType::String,
    });
    additive.rows = vec![serde_json::json!({
        "timestamp": "2024-01-03T00:00:00Z",
        "v": 2.0,
        "region": "eu",
    })];
    h.pipeline.ingest(&slug, additive).await.unwrap();

    let dataset = strata_core::domains::datasets::Dataset::require_by_slug(&slug, &h.pool)
        .await
        .unwrap();
    let latest = strata_core::domains::datasets::SchemaVersion::latest(dataset.id, &h.pool)
        .await
        .unwrap()
        .expect("schema version");
    assert_eq!(latest.version, 2);
}
