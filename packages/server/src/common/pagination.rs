//! Opaque cursor pagination over `(updated_at, id)` tuples.
//!
//! Cursors are base64-encoded and validated on decode; tampering is rejected
//! with a `validation` error carrying the `invalid-cursor` property so callers
//! can distinguish it from other 400s.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};

/// Opaque listing cursor: the `(updated_at, id)` of the last row seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub updated_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn new(updated_at: DateTime<Utc>, id: Uuid) -> Self {
        Self { updated_at, id }
    }

    /// Encode as an opaque base64 token.
    pub fn encode(&self) -> String {
        let raw = format!(
            "{}:{}",
            self.updated_at.timestamp_micros(),
            self.id.as_simple()
        );
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    /// Decode and validate a cursor token.
    pub fn decode(token: &str) -> CoreResult<Self> {
        let invalid =
            || CoreError::validation("invalid cursor").with_property("code", "invalid-cursor".into());
        let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (micros, id) = raw.split_once(':').ok_or_else(invalid)?;
        let micros: i64 = micros.parse().map_err(|_| invalid())?;
        let updated_at = Utc
            .timestamp_micros(micros)
            .single()
            .ok_or_else(invalid)?;
        let id = Uuid::parse_str(id).map_err(|_| invalid())?;
        Ok(Self { updated_at, id })
    }
}

/// Page of rows plus the continuation cursor, when more rows remain.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Clamp a caller-supplied page size into `1..=100`, defaulting to 25.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(25).clamp(1, 100)
}

/// Trim an over-fetched result set (`limit + 1` rows) and report whether more
/// rows remain beyond the page.
pub fn trim_results<T>(results: Vec<T>, limit: i64) -> (Vec<T>, bool) {
    let has_more = results.len() as i64 > limit;
    let results = if has_more {
        results.into_iter().take(limit as usize).collect()
    } else {
        results
    };
    (results, has_more)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trip() {
        let cursor = Cursor::new(Utc::now(), Uuid::now_v7());
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        // Micro precision survives the trip.
        assert_eq!(decoded.id, cursor.id);
        assert_eq!(
            decoded.updated_at.timestamp_micros(),
            cursor.updated_at.timestamp_micros()
        );
    }

    #[test]
    fn tampered_cursor_is_rejected() {
        let cursor = Cursor::new(Utc::now(), Uuid::now_v7()).encode();
        let mut tampered = cursor.clone();
        tampered.push('x');
        let err = Cursor::decode(&tampered).unwrap_err();
        assert_eq!(err.property("code"), Some(&serde_json::json!("invalid-cursor")));

        let err = Cursor::decode("not-base64!!").unwrap_err();
        assert_eq!(err.kind, crate::common::error::ErrorKind::Validation);
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(clamp_limit(None), 25);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(1000)), 100);
    }

    #[test]
    fn trim_detects_overflow_row() {
        let (items, more) = trim_results(vec![1, 2, 3, 4], 3);
        assert_eq!(items, vec![1, 2, 3]);
        assert!(more);

        let (items, more) = trim_results(vec![1, 2], 3);
        assert_eq!(items.len(), 2);
        assert!(!more);
    }
}
