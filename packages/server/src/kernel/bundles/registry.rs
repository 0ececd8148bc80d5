//! Bundle registry: publish, resolve, version arithmetic.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::BundleManifest;
use crate::common::error::{CoreError, CoreResult, ErrorKind};
use crate::common::ids::db_id;
use crate::kernel::storage::StorageDriver;

/// Stored bundle version.
#[derive(Debug, Clone, FromRow)]
pub struct BundleVersionRow {
    pub id: Uuid,
    pub bundle_slug: String,
    pub version: String,
    pub manifest: serde_json::Value,
    pub checksum: String,
    pub capability_flags: Vec<String>,
    pub artifact_storage: String,
    pub artifact_path: String,
    pub artifact_size: i64,
    pub immutable: bool,
    pub status: String,
    pub published_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BundleVersionRow {
    pub fn parsed_manifest(&self) -> CoreResult<BundleManifest> {
        BundleManifest::from_value(&self.manifest)
    }

    pub fn fingerprint(&self) -> String {
        format!("{}@{}:{}", self.bundle_slug, self.version, self.checksum)
    }
}

/// Publish request.
#[derive(Debug, Clone)]
pub struct PublishBundle {
    pub slug: String,
    pub version: String,
    pub display_name: String,
    pub manifest: serde_json::Value,
    pub capability_flags: Vec<String>,
    pub artifact: Bytes,
    pub published_by: Option<String>,
}

pub struct BundleRegistry {
    pool: PgPool,
    store: Arc<dyn StorageDriver>,
}

const VERSION_SELECT: &str = r#"
    SELECT id, bundle_slug, version, manifest, checksum, capability_flags,
           artifact_storage, artifact_path, artifact_size, immutable, status,
           published_by, created_at, updated_at
    FROM bundle_versions
"#;

impl BundleRegistry {
    pub fn new(pool: PgPool, store: Arc<dyn StorageDriver>) -> Self {
        Self { pool, store }
    }

    pub fn store(&self) -> Arc<dyn StorageDriver> {
        self.store.clone()
    }

    /// Content-addressed artifact key: `bundles/<sha-prefix>/<sha>.tgz`.
    pub fn artifact_key(checksum: &str) -> String {
        format!("bundles/{}/{}.tgz", &checksum[..2.min(checksum.len())], checksum)
    }

    /// Publish an artifact. Re-publishing an identical checksum is idempotent;
    /// a different checksum for an existing `(slug, version)` is rejected.
    pub async fn publish(&self, req: PublishBundle) -> CoreResult<BundleVersionRow> {
        let checksum = hex::encode(Sha256::digest(&req.artifact));

        if let Some(existing) = self.find(&req.slug, &req.version).await? {
            if existing.checksum == checksum {
                return Ok(existing);
            }
            // Deprecated versions are the one sanctioned mutability escape.
            if existing.status == "deprecated" {
                return self.replace_deprecated(existing, req, checksum).await;
            }
            return Err(CoreError::duplicate(format!(
                "bundle {}@{} already published with a different checksum",
                req.slug, req.version
            ))
            .with_property("checksum", serde_json::json!(existing.checksum)));
        }

        // Validate the manifest shape before anything durable happens.
        BundleManifest::from_value(&req.manifest)?;

        let key = Self::artifact_key(&checksum);
        let size = req.artifact.len() as i64;
        self.store.put(&key, req.artifact).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO bundles (id, slug, display_name, latest_version)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (slug) DO UPDATE SET
                latest_version = EXCLUDED.latest_version,
                updated_at = NOW()
            "#,
        )
        .bind(db_id())
        .bind(&req.slug)
        .bind(&req.display_name)
        .bind(&req.version)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, BundleVersionRow>(
            r#"
            INSERT INTO bundle_versions (
                id, bundle_slug, version, manifest, checksum, capability_flags,
                artifact_storage, artifact_path, artifact_size, immutable,
                status, published_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, 'published', $10)
            RETURNING id, bundle_slug, version, manifest, checksum,
                      capability_flags, artifact_storage, artifact_path,
                      artifact_size, immutable, status, published_by,
                      created_at, updated_at
            "#,
        )
        .bind(db_id())
        .bind(&req.slug)
        .bind(&req.version)
        .bind(&req.manifest)
        .bind(&checksum)
        .bind(&req.capability_flags)
        .bind(self.store.backend())
        .bind(&key)
        .bind(size)
        .bind(&req.published_by)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::duplicate(
                format!("bundle {}@{} already published", req.slug, req.version),
            ),
            _ => CoreError::from(e),
        })?;
        tx.commit().await?;

        info!(slug = %req.slug, version = %req.version, checksum = %checksum, "bundle published");
        Ok(row)
    }

    async fn replace_deprecated(
        &self,
        existing: BundleVersionRow,
        req: PublishBundle,
        checksum: String,
    ) -> CoreResult<BundleVersionRow> {
        BundleManifest::from_value(&req.manifest)?;
        let key = Self::artifact_key(&checksum);
        let size = req.artifact.len() as i64;
        self.store.put(&key, req.artifact).await?;

        let row = sqlx::query_as::<_, BundleVersionRow>(
            r#"
            UPDATE bundle_versions
            SET manifest = $1, checksum = $2, capability_flags = $3,
                artifact_storage = $4, artifact_path = $5, artifact_size = $6,
                immutable = TRUE, status = 'published', published_by = $7,
                updated_at = NOW()
            WHERE id = $8
            RETURNING id, bundle_slug, version, manifest, checksum,
                      capability_flags, artifact_storage, artifact_path,
                      artifact_size, immutable, status, published_by,
                      created_at, updated_at
            "#,
        )
        .bind(&req.manifest)
        .bind(&checksum)
        .bind(&req.capability_flags)
        .bind(self.store.backend())
        .bind(&key)
        .bind(size)
        .bind(&req.published_by)
        .bind(existing.id)
        .fetch_one(&self.pool)
        .await?;

        info!(slug = %row.bundle_slug, version = %row.version, "deprecated bundle replaced");
        Ok(row)
    }

    async fn find(&self, slug: &str, version: &str) -> CoreResult<Option<BundleVersionRow>> {
        let row = sqlx::query_as::<_, BundleVersionRow>(&format!(
            "{VERSION_SELECT} WHERE bundle_slug = $1 AND version = $2"
        ))
        .bind(slug)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Resolve a version row; missing rows surface `bundle-not-found`.
    pub async fn resolve(&self, slug: &str, version: &str) -> CoreResult<BundleVersionRow> {
        self.find(slug, version).await?.ok_or_else(|| {
            CoreError::new(
                ErrorKind::BundleNotFound,
                format!("bundle {slug}@{version} not found"),
            )
        })
    }

    /// List versions for a slug, newest first.
    pub async fn list_versions(&self, slug: &str, limit: i64) -> CoreResult<Vec<BundleVersionRow>> {
        let rows = sqlx::query_as::<_, BundleVersionRow>(&format!(
            "{VERSION_SELECT} WHERE bundle_slug = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(slug)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Mark a published version as deprecated. Deprecated versions may be
    /// replaced by a later publish with the same version string.
    pub async fn deprecate(&self, slug: &str, version: &str) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE bundle_versions
            SET status = 'deprecated', immutable = FALSE, updated_at = NOW()
            WHERE bundle_slug = $1 AND version = $2
            "#,
        )
        .bind(slug)
        .bind(version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::new(
                ErrorKind::BundleNotFound,
                format!("bundle {slug}@{version} not found"),
            ));
        }
        Ok(())
    }

    /// Monotonic semantic bump of a base version (patch component).
    pub fn next_version(base: &str) -> CoreResult<String> {
        let parts: Vec<&str> = base.split('.').collect();
        if parts.len() != 3 {
            return Err(CoreError::validation(format!(
                "version {base} is not <major>.<minor>.<patch>"
            )));
        }
        let major: u64 = parts[0]
            .parse()
            .map_err(|_| CoreError::validation(format!("bad major in {base}")))?;
        let minor: u64 = parts[1]
            .parse()
            .map_err(|_| CoreError::validation(format!("bad minor in {base}")))?;
        let patch: u64 = parts[2]
            .parse()
            .map_err(|_| CoreError::validation(format!("bad patch in {base}")))?;
        Ok(format!("{major}.{minor}.{}", patch + 1))
    }
}

/// Build a gzipped tar archive from `(path, contents)` pairs. Used by the
/// snippet publisher and the test harness.
pub fn pack_archive(files: &[(&str, &[u8])]) -> CoreResult<Bytes> {
    let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
        Vec::new(),
        flate2::Compression::default(),
    ));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, *contents)
            .map_err(|e| CoreError::execution(format!("pack {path}: {e}")))?;
    }
    let encoder = builder
        .into_inner()
        .map_err(|e| CoreError::execution(format!("finish archive: {e}")))?;
    let data = encoder
        .finish()
        .map_err(|e| CoreError::execution(format!("finish gzip: {e}")))?;
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_version_bumps_patch() {
        assert_eq!(BundleRegistry::next_version("1.2.3").unwrap(), "1.2.4");
        assert_eq!(BundleRegistry::next_version("0.0.0").unwrap(), "0.0.1");
        assert!(BundleRegistry::next_version("1.2").is_err());
        assert!(BundleRegistry::next_version("a.b.c").is_err());
    }

    #[test]
    fn artifact_key_is_content_addressed() {
        let key = BundleRegistry::artifact_key("abcdef0123");
        assert_eq!(key, "bundles/ab/abcdef0123.tgz");
    }

    #[test]
    fn pack_archive_produces_gzip() {
        let archive = pack_archive(&[("manifest.json", b"{}" as &[u8])]).unwrap();
        // Gzip magic bytes.
        assert_eq!(&archive[..2], &[0x1f, 0x8b]);
    }
}
