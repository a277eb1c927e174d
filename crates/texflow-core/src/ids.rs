//! Record ids and lease tokens.
//!
//! Stores hand out UUIDv7 strings, which sort by creation time. Ids
//! written by other clients stay opaque.

use uuid::Uuid;

/// A fresh id for a document inserted without one.
pub fn record_id() -> String {
    Uuid::now_v7().to_string()
}

/// A fresh token identifying one lease of one task.
///
/// ```
/// use texflow_core::ids::lease_token;
///
/// let first = lease_token();
/// let second = lease_token();
/// assert_eq!(first.get_version_num(), 7);
/// assert_ne!(first, second);
/// ```
pub fn lease_token() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ids_are_distinct_uuids() {
        let a = record_id();
        let b = record_id();
        assert_ne!(a, b);
        assert_eq!(Uuid::parse_str(&a).unwrap().get_version_num(), 7);
    }
}
