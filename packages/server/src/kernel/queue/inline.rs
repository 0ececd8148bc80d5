//! Inline queue mode.
//!
//! Every operation executes synchronously on the calling thread, which gives
//! tests and single-process deployments the queue contract without a broker.
//! Startup refuses this mode unless configuration explicitly allows it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{EnqueueOptions, JobEnvelope, Queue, QueueHandler, QueueHealth};
use crate::common::error::{CoreError, CoreResult};
use crate::common::ids::db_id;

#[derive(Default)]
struct InlineState {
    handlers: HashMap<String, Arc<dyn QueueHandler>>,
    /// Completed dedupe keys → the job id that ran.
    seen: HashMap<(String, String), Uuid>,
    last_error: Option<String>,
}

pub struct InlineQueue {
    state: Mutex<InlineState>,
}

impl InlineQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InlineState::default()),
        }
    }
}

impl Default for InlineQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for InlineQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> CoreResult<Uuid> {
        let handler = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(key) = &opts.job_id {
                if let Some(id) = state.seen.get(&(queue_name.to_string(), key.clone())) {
                    debug!(queue = queue_name, key = %key, "inline enqueue absorbed by dedupe");
                    return Ok(*id);
                }
            }
            state.handlers.get(queue_name).cloned()
        };

        let handler = handler.ok_or_else(|| {
            CoreError::unavailable(format!("no worker registered for queue {queue_name}"))
        })?;

        let job_id = db_id();
        let max_attempts = opts.max_attempts.unwrap_or(3).max(1);
        let mut attempt = 1;
        let result = loop {
            let envelope = JobEnvelope {
                job_id,
                queue_name: queue_name.to_string(),
                payload: payload.clone(),
                attempt,
            };
            match handler.handle(envelope).await {
                Ok(()) => break Ok(()),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    attempt += 1;
                }
                Err(err) => break Err(err),
            }
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(key) = opts.job_id {
            state.seen.insert((queue_name.to_string(), key), job_id);
        }
        match result {
            Ok(()) => Ok(job_id),
            Err(err) => {
                state.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn register_worker(
        &self,
        queue_name: &str,
        _concurrency: usize,
        handler: Arc<dyn QueueHandler>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.handlers.insert(queue_name.to_string(), handler);
        Ok(())
    }

    async fn cancel(&self, _job_id: Uuid) -> CoreResult<bool> {
        // Inline jobs complete before enqueue returns; nothing is pending.
        Ok(false)
    }

    fn health(&self) -> QueueHealth {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        QueueHealth {
            ready: true,
            inline: true,
            last_error: state.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        calls: Mutex<Vec<(Uuid, i32)>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl QueueHandler for Recorder {
        async fn handle(&self, job: JobEnvelope) -> CoreResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push((job.job_id, job.attempt));
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(CoreError::unavailable("flaky"));
            }
            Ok(())
        }
    }

    fn recorder(fail_first: usize) -> Arc<Recorder> {
        Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
            fail_first: AtomicUsize::new(fail_first),
        })
    }

    #[tokio::test]
    async fn executes_synchronously_in_enqueue_order() {
        let queue = InlineQueue::new();
        let handler = recorder(0);
        queue
            .register_worker("q", 1, handler.clone())
            .await
            .unwrap();

        let a = queue
            .enqueue("q", serde_json::json!({"n": 1}), EnqueueOptions::default())
            .await
            .unwrap();
        let b = queue
            .enqueue("q", serde_json::json!({"n": 2}), EnqueueOptions::default())
            .await
            .unwrap();

        let calls = handler.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, a);
        assert_eq!(calls[1].0, b);
    }

    #[tokio::test]
    async fn retries_retryable_failures_up_to_max_attempts() {
        let queue = InlineQueue::new();
        let handler = recorder(2);
        queue
            .register_worker("q", 1, handler.clone())
            .await
            .unwrap();

        queue
            .enqueue(
                "q",
                serde_json::json!({}),
                EnqueueOptions {
                    max_attempts: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let attempts: Vec<i32> = handler.calls.lock().unwrap().iter().map(|c| c.1).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn dedupe_key_absorbs_repeat_enqueues() {
        let queue = InlineQueue::new();
        let handler = recorder(0);
        queue
            .register_worker("q", 1, handler.clone())
            .await
            .unwrap();

        let opts = || EnqueueOptions {
            job_id: Some("once".to_string()),
            ..Default::default()
        };
        let first = queue.enqueue("q", serde_json::json!({}), opts()).await.unwrap();
        let second = queue.enqueue("q", serde_json::json!({}), opts()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(handler.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_worker_is_unavailable() {
        let queue = InlineQueue::new();
        let err = queue
            .enqueue("nobody", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::common::error::ErrorKind::Unavailable);
        assert!(queue.health().inline);
    }
}
