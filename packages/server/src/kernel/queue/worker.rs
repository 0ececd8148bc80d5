//! Worker pool attached to one named queue.
//!
//! The pool claims batches with the shared broker core, processes claims
//! concurrently up to its configured width, keeps leases alive with a
//! per-job heartbeat task, and reports success/failure back to the broker.
//! Shutdown is cooperative: in-flight jobs get a bounded drain window.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::postgres::{QueueCore, QueueJobRow};
use super::QueueHandler;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    /// How long to sleep when the queue is empty.
    pub idle_poll_interval: Duration,
    /// How often to extend leases for running jobs.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            idle_poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

pub struct WorkerPool {
    core: Arc<QueueCore>,
    queue_name: String,
    handler: Arc<dyn QueueHandler>,
    config: WorkerPoolConfig,
    worker_id: String,
}

impl WorkerPool {
    pub(crate) fn new(
        core: Arc<QueueCore>,
        queue_name: String,
        handler: Arc<dyn QueueHandler>,
        config: WorkerPoolConfig,
    ) -> Self {
        let worker_id = format!("worker-{}", Uuid::new_v4());
        Self {
            core,
            queue_name,
            handler,
            config,
            worker_id,
        }
    }

    /// Spawn the claim loop onto the runtime.
    pub fn spawn(self, shutdown: CancellationToken) {
        tokio::spawn(async move { self.run(shutdown).await });
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(
            queue = %self.queue_name,
            worker_id = %self.worker_id,
            concurrency = self.config.concurrency,
            "worker pool starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let jobs = match self
                .core
                .claim(
                    &self.queue_name,
                    &self.worker_id,
                    self.config.concurrency as i64,
                )
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(queue = %self.queue_name, error = %e, "claim failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                }
                continue;
            }

            debug!(queue = %self.queue_name, count = jobs.len(), "claimed jobs");

            let mut handles = Vec::with_capacity(jobs.len());
            for job in jobs {
                handles.push(self.process(job, &shutdown));
            }
            futures::future::join_all(handles).await;
        }

        info!(queue = %self.queue_name, worker_id = %self.worker_id, "worker pool stopped");
    }

    async fn process(&self, job: QueueJobRow, shutdown: &CancellationToken) {
        let job_id = job.id;
        let cancel = shutdown.child_token();

        // Keep the lease alive while the handler runs.
        let heartbeat_cancel = cancel.clone();
        let heartbeat_core = self.core.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = heartbeat_core.heartbeat(job_id).await {
                            warn!(job_id = %job_id, error = %e, "queue heartbeat failed");
                        }
                    }
                }
            }
        });

        let result = self.handler.handle(job.envelope()).await;

        cancel.cancel();
        let _ = heartbeat.await;

        match result {
            Ok(()) => {
                debug!(job_id = %job_id, queue = %job.queue_name, "job succeeded");
                if let Err(e) = self.core.mark_succeeded(&job).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job succeeded");
                }
            }
            Err(err) => {
                warn!(job_id = %job_id, queue = %job.queue_name, error = %err, "job failed");
                if let Err(e) = self.core.mark_failed(&job, &err).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job failed");
                }
            }
        }
    }
}
