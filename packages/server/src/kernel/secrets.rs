//! Secret resolution for job handlers.
//!
//! Resolved values never appear in logs, telemetry, or result fields; every
//! resolve is audited with `(run_id, job_slug, reference)`. Audit failures are
//! logged and counted, never surfaced to the caller.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::common::error::CoreResult;
use crate::common::ids::db_id;

/// Backend contract: given a reference like `env:MY_TOKEN`, return the value
/// or `None` when the reference does not resolve.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> CoreResult<Option<String>>;
}

/// Environment-backed resolver: `env:<NAME>` references read process env.
pub struct EnvSecretResolver;

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve(&self, reference: &str) -> CoreResult<Option<String>> {
        let Some(name) = reference.strip_prefix("env:") else {
            return Ok(None);
        };
        Ok(std::env::var(name).ok())
    }
}

/// Audited wrapper handed to run contexts.
pub struct SecretAccess {
    resolver: std::sync::Arc<dyn SecretResolver>,
    pool: Option<PgPool>,
}

impl SecretAccess {
    pub fn new(resolver: std::sync::Arc<dyn SecretResolver>, pool: Option<PgPool>) -> Self {
        Self { resolver, pool }
    }

    pub async fn resolve(
        &self,
        run_id: Uuid,
        job_slug: &str,
        reference: &str,
    ) -> CoreResult<Option<String>> {
        let value = self.resolver.resolve(reference).await?;
        self.audit(run_id, job_slug, reference).await;
        Ok(value)
    }

    async fn audit(&self, run_id: Uuid, job_slug: &str, reference: &str) {
        let Some(pool) = &self.pool else {
            return;
        };
        let result = sqlx::query(
            r#"
            INSERT INTO secret_access_audit (id, run_id, job_slug, reference)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(db_id())
        .bind(run_id)
        .bind(job_slug)
        .bind(reference)
        .execute(pool)
        .await;
        if let Err(e) = result {
            warn!(run_id = %run_id, job_slug, error = %e, "secret access audit failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn env_resolver_reads_prefixed_references() {
        std::env::set_var("STRATA_TEST_SECRET", "hunter2");
        let resolver = EnvSecretResolver;
        assert_eq!(
            resolver.resolve("env:STRATA_TEST_SECRET").await.unwrap(),
            Some("hunter2".to_string())
        );
        assert_eq!(resolver.resolve("env:STRATA_MISSING").await.unwrap(), None);
        assert_eq!(resolver.resolve("vault/path").await.unwrap(), None);
        std::env::remove_var("STRATA_TEST_SECRET");
    }
}
