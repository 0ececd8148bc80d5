//! Strata: a time-partitioned dataset platform.
//!
//! Two cores share one spine. The job execution core runs versioned,
//! bundle-backed jobs in sandboxes with retries, heartbeats, and recovery.
//! The storage lifecycle core manages dataset manifests, partition files,
//! ingestion, retention/compaction/migration, and a pruning query planner.
//! Between them sit a durable Postgres-backed queue (with an inline mode for
//! single-process deployments), one metadata store, and one caching
//! discipline built on a typed invalidation bus.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::Config;
