//! Per-column bloom filters.
//!
//! Built at ingestion time over string column values and consulted by the
//! query planner to skip partitions for equality predicates. Serialized as
//! `{m, k, bits}` with hex-encoded bits so they survive the JSONB round trip.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloomFilter {
    /// Number of bits.
    pub m: u32,
    /// Number of hash functions.
    pub k: u32,
    /// Hex-encoded bit array.
    pub bits: String,
}

const DEFAULT_K: u32 = 4;
const BITS_PER_VALUE: usize = 10;
const MIN_BITS: usize = 64;

fn hash(value: &str, seed: u32) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_be_bytes());
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
}

impl BloomFilter {
    /// Build a filter sized for the given values.
    pub fn build<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let values: Vec<&str> = values.into_iter().collect();
        let m = (values.len() * BITS_PER_VALUE)
            .max(MIN_BITS)
            .next_multiple_of(8) as u32;
        let mut bits = vec![0u8; (m / 8) as usize];
        for value in &values {
            for seed in 0..DEFAULT_K {
                let bit = (hash(value, seed) % m as u64) as usize;
                bits[bit / 8] |= 1 << (bit % 8);
            }
        }
        Self {
            m,
            k: DEFAULT_K,
            bits: hex::encode(bits),
        }
    }

    /// Definitely-absent test: `false` means the value cannot be in the
    /// column; `true` means it might be.
    pub fn may_contain(&self, value: &str) -> bool {
        let Ok(bits) = hex::decode(&self.bits) else {
            // Malformed filter: never prune.
            return true;
        };
        if self.m == 0 || bits.len() != (self.m / 8) as usize {
            return true;
        }
        for seed in 0..self.k {
            let bit = (hash(value, seed) % self.m as u64) as usize;
            if bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_are_always_found() {
        let values = ["alpha", "beta", "gamma", "delta"];
        let filter = BloomFilter::build(values);
        for value in values {
            assert!(filter.may_contain(value));
        }
    }

    #[test]
    fn absent_values_are_usually_rejected() {
        let values: Vec<String> = (0..100).map(|i| format!("node-{i}")).collect();
        let filter = BloomFilter::build(values.iter().map(String::as_str));

        let misses = (1000..1100)
            .filter(|i| !filter.may_contain(&format!("node-{i}")))
            .count();
        // With 10 bits/value and 4 hashes the false-positive rate is ~1%;
        // anything above 80 rejections out of 100 means the filter works.
        assert!(misses > 80, "only {misses} rejections");
    }

    #[test]
    fn serialization_round_trips() {
        let filter = BloomFilter::build(["x", "y"]);
        let value = serde_json::to_value(&filter).unwrap();
        let back = BloomFilter::from_value(&value).unwrap();
        assert_eq!(filter, back);
        assert!(back.may_contain("x"));
    }

    #[test]
    fn malformed_filters_never_prune() {
        let filter = BloomFilter {
            m: 64,
            k: 4,
            bits: "zz-not-hex".to_string(),
        };
        assert!(filter.may_contain("anything"));
    }
}
