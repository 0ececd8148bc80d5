//! Row identifier helper.

use uuid::Uuid;

/// Generate a time-ordered id for database rows.
///
/// V7 UUIDs sort by creation time, which keeps cursor pagination stable and
/// index pages warm.
pub fn db_id() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_ids_are_time_ordered() {
        let a = db_id();
        let b = db_id();
        assert!(a < b || a.get_timestamp() == b.get_timestamp());
    }
}
