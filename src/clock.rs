//! Wall-clock timestamps and id generation.
use chrono::Utc;
use uuid::Uuid;

/// Returns the current wall-clock time as epoch milliseconds.
pub fn epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Returns a fresh collision-resistant identifier.
///
/// Ids are random UUIDs, never derived from the current time.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn epoch_ms_is_monotonic_enough() {
        let a = epoch_ms();
        let b = epoch_ms();
        assert!(b >= a);
        // Sanity: later than 2020-01-01.
        assert!(a > 1_577_836_800_000);
    }

    #[test]
    fn ids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(new_id()));
        }
    }

    #[test]
    fn ids_parse_as_uuids() {
        let id = new_id();
        assert!(Uuid::parse_str(&id).is_ok());
    }
}
