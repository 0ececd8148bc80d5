//! Columnar backend driver.
//!
//! The SQL engine behind queries and metadata offload is external; the core
//! only speaks this narrow interface. The HTTP implementation targets a
//! ClickHouse-compatible endpoint; tests substitute the in-memory double.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::common::error::{CoreError, CoreResult};

#[async_trait]
pub trait ColumnarDriver: Send + Sync {
    /// Append rows to a table, JSON object per row.
    async fn insert_rows(&self, table: &str, rows: &[serde_json::Value]) -> CoreResult<()>;

    /// Run a SELECT and return JSON rows.
    async fn query_json(&self, sql: &str) -> CoreResult<Vec<serde_json::Value>>;
}

// ============================================================================
// HTTP (ClickHouse-compatible)
// ============================================================================

pub struct ClickHouseHttpDriver {
    client: reqwest::Client,
    base_url: String,
}

impl ClickHouseHttpDriver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ColumnarDriver for ClickHouseHttpDriver {
    async fn insert_rows(&self, table: &str, rows: &[serde_json::Value]) -> CoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut body = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut body, row)?;
            body.push(b'\n');
        }
        let resp = self
            .client
            .post(&self.base_url)
            .query(&[(
                "query",
                format!("INSERT INTO {table} FORMAT JSONEachRow"),
            )])
            .body(body)
            .send()
            .await
            .map_err(|e| CoreError::unavailable(format!("columnar insert: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(CoreError::unavailable(format!(
                "columnar insert into {table}: {status} {detail}"
            )));
        }
        Ok(())
    }

    async fn query_json(&self, sql: &str) -> CoreResult<Vec<serde_json::Value>> {
        let resp = self
            .client
            .post(&self.base_url)
            .query(&[("default_format", "JSON")])
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| CoreError::unavailable(format!("columnar query: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(CoreError::unavailable(format!(
                "columnar query: {status} {detail}"
            )));
        }
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::execution(format!("columnar response: {e}")))?;
        Ok(payload
            .get("data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// In-memory double
// ============================================================================

#[derive(Default)]
pub struct InMemoryColumnar {
    tables: Mutex<HashMap<String, Vec<serde_json::Value>>>,
}

impl InMemoryColumnar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: &str) -> Vec<serde_json::Value> {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ColumnarDriver for InMemoryColumnar {
    async fn insert_rows(&self, table: &str, rows: &[serde_json::Value]) -> CoreResult<()> {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }

    async fn query_json(&self, _sql: &str) -> CoreResult<Vec<serde_json::Value>> {
        Err(CoreError::unavailable(
            "in-memory columnar double does not evaluate SQL",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_double_accumulates_rows() {
        let columnar = InMemoryColumnar::new();
        columnar
            .insert_rows("audit", &[serde_json::json!({"a": 1})])
            .await
            .unwrap();
        columnar
            .insert_rows("audit", &[serde_json::json!({"a": 2})])
            .await
            .unwrap();
        assert_eq!(columnar.rows("audit").len(), 2);
        assert!(columnar.rows("other").is_empty());
    }
}
