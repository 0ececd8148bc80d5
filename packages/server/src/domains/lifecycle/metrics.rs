//! Lifecycle engine metrics.
//!
//! Global counters plus per-operation totals and a capped ring of chunk
//! samples (200), surfaced by `GET /admin/lifecycle/status`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub const SAMPLE_CAP: usize = 200;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSample {
    pub id: Uuid,
    pub operation: String,
    pub bytes: i64,
    pub partitions: usize,
    pub duration_ms: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationTotals {
    pub partitions: i64,
    pub bytes: i64,
}

#[derive(Default)]
struct State {
    jobs_started: u64,
    jobs_completed: u64,
    jobs_failed: u64,
    jobs_skipped: u64,
    last_run_at: Option<DateTime<Utc>>,
    last_error_at: Option<DateTime<Utc>>,
    operation_totals: HashMap<String, OperationTotals>,
    samples: VecDeque<ChunkSample>,
}

#[derive(Default)]
pub struct LifecycleMetrics {
    state: Mutex<State>,
}

/// Serializable snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleMetricsSnapshot {
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub operation_totals: HashMap<String, OperationTotals>,
    pub samples: Vec<ChunkSample>,
}

impl LifecycleMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn job_started(&self) {
        let mut state = self.lock();
        state.jobs_started += 1;
        state.last_run_at = Some(Utc::now());
    }

    pub fn job_completed(&self) {
        self.lock().jobs_completed += 1;
    }

    pub fn job_failed(&self) {
        let mut state = self.lock();
        state.jobs_failed += 1;
        state.last_error_at = Some(Utc::now());
    }

    pub fn job_skipped(&self) {
        self.lock().jobs_skipped += 1;
    }

    /// Record an operation's totals for one dataset pass.
    pub fn record_operation(&self, operation: &str, partitions: i64, bytes: i64) {
        let mut state = self.lock();
        let totals = state
            .operation_totals
            .entry(operation.to_string())
            .or_default();
        totals.partitions += partitions;
        totals.bytes += bytes;
    }

    /// Push a chunk sample; the ring drops the oldest past the cap.
    pub fn record_sample(&self, sample: ChunkSample) {
        let mut state = self.lock();
        if state.samples.len() >= SAMPLE_CAP {
            state.samples.pop_front();
        }
        state.samples.push_back(sample);
    }

    pub fn snapshot(&self) -> LifecycleMetricsSnapshot {
        let state = self.lock();
        LifecycleMetricsSnapshot {
            jobs_started: state.jobs_started,
            jobs_completed: state.jobs_completed,
            jobs_failed: state.jobs_failed,
            jobs_skipped: state.jobs_skipped,
            last_run_at: state.last_run_at,
            last_error_at: state.last_error_at,
            operation_totals: state.operation_totals.clone(),
            samples: state.samples.iter().cloned().collect(),
        }
    }
}
