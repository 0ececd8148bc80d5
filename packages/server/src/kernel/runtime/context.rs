//! Run context handed to executing handlers.
//!
//! `update` persists a context patch plus a heartbeat, `heartbeat` records
//! liveness only, `resolve_secret` goes through the audited secret access
//! path, and `log` lands in the run's log buffer.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::common::error::CoreResult;
use crate::kernel::sandbox::{LogBuffer, RunContext};
use crate::kernel::secrets::SecretAccess;

use super::store::JobStore;

pub struct RuntimeRunContext {
    run_id: Uuid,
    job_slug: String,
    store: Arc<dyn JobStore>,
    secrets: Arc<SecretAccess>,
    logs: LogBuffer,
}

impl RuntimeRunContext {
    pub fn new(
        run_id: Uuid,
        job_slug: impl Into<String>,
        store: Arc<dyn JobStore>,
        secrets: Arc<SecretAccess>,
        logs: LogBuffer,
    ) -> Self {
        Self {
            run_id,
            job_slug: job_slug.into(),
            store,
            secrets,
            logs,
        }
    }

    pub fn logs(&self) -> LogBuffer {
        self.logs.clone()
    }
}

#[async_trait]
impl RunContext for RuntimeRunContext {
    async fn update(&self, patch: serde_json::Value) -> CoreResult<()> {
        self.store.heartbeat_run(self.run_id, Some(patch)).await
    }

    async fn heartbeat(&self) -> CoreResult<()> {
        self.store.heartbeat_run(self.run_id, None).await
    }

    async fn resolve_secret(&self, reference: &str) -> CoreResult<Option<String>> {
        self.secrets
            .resolve(self.run_id, &self.job_slug, reference)
            .await
    }

    fn log(&self, message: &str, meta: Option<serde_json::Value>) {
        self.logs.push(message, meta);
    }
}
