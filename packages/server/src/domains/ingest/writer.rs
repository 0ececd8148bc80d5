//! Partition file formats.
//!
//! Two write formats: `jsonl` (legacy, row-major lines) and `columnar`
//! (column-major blocks the local executor scans without materializing
//! rows it does not need). Both round-trip through the storage driver.

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::common::error::{CoreError, CoreResult};
use crate::domains::datasets::schema::SchemaDef;
use crate::kernel::storage::StorageDriver;

pub const FORMAT_JSONL: &str = "jsonl";
pub const FORMAT_COLUMNAR: &str = "columnar";

pub fn file_extension(format: &str) -> &'static str {
    match format {
        FORMAT_COLUMNAR => "col.json",
        _ => "jsonl",
    }
}

/// Serialize rows into the given format.
pub fn encode_rows(
    format: &str,
    schema: &SchemaDef,
    rows: &[serde_json::Value],
) -> CoreResult<Bytes> {
    match format {
        FORMAT_JSONL => {
            let mut out = Vec::new();
            for row in rows {
                serde_json::to_writer(&mut out, row)?;
                out.push(b'\n');
            }
            Ok(Bytes::from(out))
        }
        FORMAT_COLUMNAR => {
            let mut columns = serde_json::Map::new();
            for field in &schema.fields {
                let values: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|row| row.get(&field.name).cloned().unwrap_or(serde_json::Value::Null))
                    .collect();
                columns.insert(field.name.clone(), serde_json::Value::Array(values));
            }
            let block = serde_json::json!({
                "format": FORMAT_COLUMNAR,
                "rowCount": rows.len(),
                "fields": schema.fields,
                "columns": columns,
            });
            Ok(Bytes::from(serde_json::to_vec(&block)?))
        }
        other => Err(CoreError::validation(format!(
            "unknown partition format {other}"
        ))),
    }
}

/// Parse a partition file back into rows.
pub fn decode_rows(format: &str, data: &[u8]) -> CoreResult<Vec<serde_json::Value>> {
    match format {
        FORMAT_JSONL => {
            let mut rows = Vec::new();
            for line in data.split(|b| *b == b'\n') {
                if line.is_empty() {
                    continue;
                }
                rows.push(serde_json::from_slice(line)?);
            }
            Ok(rows)
        }
        FORMAT_COLUMNAR => {
            let block: serde_json::Value = serde_json::from_slice(data)?;
            let row_count = block
                .get("rowCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            let columns = block
                .get("columns")
                .and_then(|v| v.as_object())
                .ok_or_else(|| CoreError::validation("columnar block missing columns"))?;

            let mut rows = vec![serde_json::Map::new(); row_count];
            for (name, values) in columns {
                let values = values
                    .as_array()
                    .ok_or_else(|| CoreError::validation("columnar column is not an array"))?;
                for (i, value) in values.iter().enumerate().take(row_count) {
                    if !value.is_null() {
                        rows[i].insert(name.clone(), value.clone());
                    }
                }
            }
            Ok(rows.into_iter().map(serde_json::Value::Object).collect())
        }
        other => Err(CoreError::validation(format!(
            "unknown partition format {other}"
        ))),
    }
}

/// A written partition file.
pub struct WrittenPartition {
    pub file_path: String,
    pub file_size_bytes: i64,
    pub checksum: String,
}

/// Encode and persist a partition file; returns size and checksum.
pub async fn write_partition(
    storage: &dyn StorageDriver,
    file_path: &str,
    format: &str,
    schema: &SchemaDef,
    rows: &[serde_json::Value],
) -> CoreResult<WrittenPartition> {
    let data = encode_rows(format, schema, rows)?;
    let checksum = hex::encode(Sha256::digest(&data));
    let size = data.len() as i64;
    storage.put(file_path, data).await?;
    Ok(WrittenPartition {
        file_path: file_path.to_string(),
        file_size_bytes: size,
        checksum,
    })
}
