// Ingestion: row validation, partition append, idempotency.

pub mod bloom;
pub mod pipeline;
pub mod stats;
pub mod writer;

pub use bloom::BloomFilter;
pub use pipeline::{
    read_partition_rows, IngestJobHandler, IngestOutcome, IngestPipeline, IngestRequest,
    PartitionSpec, QueuedIngest, TimeRange,
};
pub use stats::{compute_column_stats, ColumnStats};
