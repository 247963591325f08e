//! Content hashing for primary-key-less tables.
//!
//! Tables without a usable primary key (spec.md §3.2/§9) are tracked by a
//! deterministic content hash of their non-generated columns instead of a
//! real PK. The hash is stable across runs and stored as the synthetic
//! `_hash` pseudo-key column so CDC and reconciliation can still address
//! individual rows.

use xxhash_rust::xxh64::xxh64;

const SEED: u64 = 0x517cc1b727220a95;

/// Compute a 64-bit content hash from a single text representation.
pub fn row_hash(input: &str) -> i64 {
    xxh64(input.as_bytes(), SEED) as i64
}

/// Compute a content hash across multiple column values, in column order.
///
/// Values are joined with a record-separator byte (`\x1E`) so that e.g.
/// `("ab", "c")` and `("a", "bc")` never collide. `None` (SQL NULL) is
/// encoded with a distinct sentinel so it never collides with the literal
/// string `"NULL"`.
pub fn row_hash_multi(values: &[Option<&str>]) -> i64 {
    let mut combined = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            combined.push('\x1E');
        }
        match value {
            Some(val) => combined.push_str(val),
            None => combined.push_str("\x00NULL\x00"),
        }
    }
    xxh64(combined.as_bytes(), SEED) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_determinism() {
        assert_eq!(row_hash("hello world"), row_hash("hello world"));
    }

    #[test]
    fn test_hash_different_inputs() {
        assert_ne!(row_hash("hello"), row_hash("world"));
    }

    #[test]
    fn test_null_handling_in_multi_hash() {
        let h1 = row_hash_multi(&[Some("a"), None, Some("b")]);
        let h2 = row_hash_multi(&[Some("a"), None, Some("c")]);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_row_hash_empty_string() {
        assert_ne!(row_hash(""), 0);
    }

    #[test]
    fn test_multi_hash_separator_prevents_collision() {
        let h1 = row_hash_multi(&[Some("ab"), Some("c")]);
        let h2 = row_hash_multi(&[Some("a"), Some("bc")]);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_multi_hash_null_vs_string_null() {
        let with_null_marker = row_hash_multi(&[None]);
        let with_string_null = row_hash_multi(&[Some("NULL")]);
        assert_ne!(
            with_null_marker, with_string_null,
            "NULL marker and string 'NULL' should hash differently"
        );
    }

    #[test]
    fn test_multi_hash_order_sensitive() {
        let h1 = row_hash_multi(&[Some("x"), Some("y")]);
        let h2 = row_hash_multi(&[Some("y"), Some("x")]);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_row_hash_matches_multi_single_value() {
        assert_eq!(row_hash("solo"), row_hash_multi(&[Some("solo")]));
    }
}
