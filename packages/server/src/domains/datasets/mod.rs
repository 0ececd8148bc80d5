// Dataset domain: manifests, schema versions, partitions, retention.

pub mod cache;
pub mod manifest;
pub mod model;
pub mod schema;

pub use cache::{CachedManifest, InMemoryManifestCache, ManifestCache};
pub use manifest::{ManifestEngine, PublishManifest};
pub use model::{
    Dataset, DatasetManifest, DatasetPartition, DatasetStatus, ManifestStatus, NewPartition,
    RetentionPolicy, RetentionRules, SchemaVersion, StorageTarget,
};
pub use schema::{schema_incompatible, FieldDef, FieldType, SchemaCompatibility, SchemaDef};
