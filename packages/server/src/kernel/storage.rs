//! Object storage drivers.
//!
//! Bundle artifacts and dataset partition files both go through the same
//! narrow driver interface. The filesystem driver writes atomically
//! (stage + rename); the S3 driver is a thin HTTP client with jittered
//! exponential backoff on transport failures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;

use crate::common::error::{CoreError, CoreResult};

/// Narrow object-store contract: keys are forward-slash relative paths.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn put(&self, key: &str, body: Bytes) -> CoreResult<()>;
    async fn get(&self, key: &str) -> CoreResult<Bytes>;
    async fn delete(&self, key: &str) -> CoreResult<()>;
    /// Stable name for audit/metadata rows (`filesystem`, `s3`).
    fn backend(&self) -> &'static str;
}

fn sanitize_key(key: &str) -> CoreResult<&str> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|c| c == "..") {
        return Err(CoreError::validation(format!("invalid storage key: {key}")));
    }
    Ok(key)
}

// ============================================================================
// Filesystem
// ============================================================================

pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> CoreResult<PathBuf> {
        Ok(self.root.join(sanitize_key(key)?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl StorageDriver for FilesystemStorage {
    async fn put(&self, key: &str, body: Bytes) -> CoreResult<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::unavailable(format!("mkdir {}: {e}", parent.display())))?;
        }
        // Stage next to the target so the rename stays on one filesystem.
        let staged = path.with_extension("tmp-write");
        tokio::fs::write(&staged, &body)
            .await
            .map_err(|e| CoreError::unavailable(format!("write {}: {e}", staged.display())))?;
        tokio::fs::rename(&staged, &path)
            .await
            .map_err(|e| CoreError::unavailable(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> CoreResult<Bytes> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CoreError::not_found(
                format!("object missing: {key}"),
            )),
            Err(e) => Err(CoreError::unavailable(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::unavailable(format!(
                "delete {}: {e}",
                path.display()
            ))),
        }
    }

    fn backend(&self) -> &'static str {
        "filesystem"
    }
}

// ============================================================================
// S3-compatible HTTP
// ============================================================================

/// Minimal S3-compatible driver speaking plain HTTP to a gateway endpoint.
pub struct S3Storage {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
}

const S3_MAX_ATTEMPTS: u32 = 3;

impl S3Storage {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            bucket: bucket.into(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            key
        )
    }

    async fn with_retry<F, Fut>(&self, op: F) -> CoreResult<reqwest::Response>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut last_err = None;
        for attempt in 0..S3_MAX_ATTEMPTS {
            match op().await {
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = Some(CoreError::unavailable(format!(
                        "object store returned {}",
                        resp.status()
                    )));
                }
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    last_err = Some(CoreError::unavailable(format!("object store: {e}")));
                }
            }
            let backoff = Duration::from_millis(
                100u64.saturating_mul(1 << attempt) + rand::thread_rng().gen_range(0..50),
            );
            tokio::time::sleep(backoff).await;
        }
        Err(last_err.unwrap_or_else(|| CoreError::unavailable("object store unreachable")))
    }
}

#[async_trait]
impl StorageDriver for S3Storage {
    async fn put(&self, key: &str, body: Bytes) -> CoreResult<()> {
        let url = self.url(sanitize_key(key)?);
        let resp = self
            .with_retry(|| self.client.put(&url).body(body.clone()).send())
            .await?;
        if !resp.status().is_success() {
            return Err(CoreError::unavailable(format!(
                "object store PUT {key}: {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> CoreResult<Bytes> {
        let url = self.url(sanitize_key(key)?);
        let resp = self.with_retry(|| self.client.get(&url).send()).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoreError::not_found(format!("object missing: {key}")));
        }
        if !resp.status().is_success() {
            return Err(CoreError::unavailable(format!(
                "object store GET {key}: {}",
                resp.status()
            )));
        }
        resp.bytes()
            .await
            .map_err(|e| CoreError::unavailable(format!("object store body: {e}")))
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        let url = self.url(sanitize_key(key)?);
        let resp = self.with_retry(|| self.client.delete(&url).send()).await?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(CoreError::unavailable(format!(
            "object store DELETE {key}: {}",
            resp.status()
        )))
    }

    fn backend(&self) -> &'static str {
        "s3"
    }
}
