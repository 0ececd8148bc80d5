//! Process-wide prometheus registry.
//!
//! One registry owned by the kernel; subsystems register their collectors at
//! startup and the HTTP layer renders text exposition at `GET /metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::common::error::{CoreError, CoreResult};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub job_runs_started: IntCounter,
    pub job_runs_completed: IntCounterVec,
    pub ingestions: IntCounterVec,
    pub queries: IntCounter,
    pub audit_write_failures: IntCounter,
}

impl Metrics {
    pub fn new() -> CoreResult<Self> {
        let registry = Registry::new();

        let job_runs_started =
            IntCounter::with_opts(Opts::new("strata_job_runs_started", "Job runs started"))
                .map_err(metrics_err)?;
        let job_runs_completed = IntCounterVec::new(
            Opts::new("strata_job_runs_completed", "Job runs by terminal status"),
            &["status"],
        )
        .map_err(metrics_err)?;
        let ingestions = IntCounterVec::new(
            Opts::new("strata_ingestions", "Ingestion requests by mode"),
            &["mode"],
        )
        .map_err(metrics_err)?;
        let queries =
            IntCounter::with_opts(Opts::new("strata_queries", "Dataset queries executed"))
                .map_err(metrics_err)?;
        let audit_write_failures = IntCounter::with_opts(Opts::new(
            "strata_audit_write_failures",
            "Audit appends that failed and were dropped",
        ))
        .map_err(metrics_err)?;

        registry
            .register(Box::new(job_runs_started.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(job_runs_completed.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(ingestions.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(queries.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(audit_write_failures.clone()))
            .map_err(metrics_err)?;

        Ok(Self {
            registry,
            job_runs_started,
            job_runs_completed,
            ingestions,
            queries,
            audit_write_failures,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in prometheus text exposition format.
    pub fn render(&self) -> CoreResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(metrics_err)?;
        String::from_utf8(buf).map_err(|e| CoreError::execution(format!("metrics encoding: {e}")))
    }
}

fn metrics_err(e: prometheus::Error) -> CoreError {
    CoreError::execution(format!("metrics registry: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_exposes_registered_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.job_runs_started.inc();
        metrics
            .job_runs_completed
            .with_label_values(&["succeeded"])
            .inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("strata_job_runs_started 1"));
        assert!(text.contains("strata_job_runs_completed"));
    }
}
