//! Value Normalizer (C3) — per-engine pure function mapping a raw source
//! cell into a PostgreSQL literal (spec §4.3.4).
//!
//! Every adapter's rows pass through here uniformly, PostgreSQL sources
//! included: normalisation is idempotent (P6, see the test below), so
//! there's no need for callers to special-case an already-canonical
//! source.
//!
//! Grounded on `original_source/src/sync/OracleToPostgres.cpp` and
//! `MongoDBToPostgres.cpp`'s `cleanValueForPostgres`, generalised into one
//! engine-neutral function driven by the target PostgreSQL type.

use std::borrow::Cow;

/// Target PostgreSQL column type, as far as normalisation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgType {
    Text,
    Integer,
    Bigint,
    Numeric,
    Boolean,
    Timestamp,
    Date,
    Time,
    Bytea,
    Jsonb,
}

/// The result of normalising one cell: either a SQL `NULL`, or a value
/// string ready to be bound as a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedValue {
    Null,
    Value(String),
}

/// Zero-dates that the source considers equivalent to NULL.
const ZERO_DATE_PREFIXES: &[&str] = &["0000-", "1900-01-01", "1970-01-01"];

fn is_null_sentinel(raw: &str, ty: PgType) -> bool {
    if raw.is_empty() || raw.eq_ignore_ascii_case("null") || raw == "\\N" || raw == "\\0" {
        return true;
    }

    if matches!(ty, PgType::Timestamp | PgType::Date)
        && ZERO_DATE_PREFIXES.iter().any(|p| raw.starts_with(p))
    {
        return true;
    }

    // Any byte outside printable ASCII (except tab/LF/CR) marks the value
    // as unrepresentable and therefore NULL.
    raw.bytes()
        .any(|b| !(0x20..=0x7E).contains(&b) && b != 0x09 && b != 0x0A && b != 0x0D)
}

fn null_default(ty: PgType) -> NormalizedValue {
    match ty {
        PgType::Text | PgType::Jsonb | PgType::Bytea => NormalizedValue::Null,
        PgType::Integer | PgType::Bigint => NormalizedValue::Value("0".to_string()),
        PgType::Numeric => NormalizedValue::Value("0.0".to_string()),
        PgType::Boolean => NormalizedValue::Value("false".to_string()),
        PgType::Timestamp => NormalizedValue::Value("1970-01-01 00:00:00".to_string()),
        PgType::Date => NormalizedValue::Value("1970-01-01".to_string()),
        PgType::Time => NormalizedValue::Value("00:00:00".to_string()),
    }
}

fn coerce_boolean(raw: &str) -> Cow<'_, str> {
    match raw {
        "N" | "0" | "false" | "FALSE" | "False" => Cow::Borrowed("false"),
        "Y" | "1" | "true" | "TRUE" | "True" => Cow::Borrowed("true"),
        other => Cow::Borrowed(other),
    }
}

/// Normalise one raw source cell into a PostgreSQL literal for the given
/// target type.
///
/// Idempotent: `normalize(normalize(v, ty).as_value(), ty) == normalize(v,
/// ty)` (spec §8 P6), since a second pass over an already-normalised,
/// printable-ASCII value never matches a NULL sentinel (except the
/// explicit `NULL` text, which only `Text` maps back onto itself as
/// `NULL`).
pub fn normalize(raw: Option<&str>, ty: PgType) -> NormalizedValue {
    let raw = match raw {
        None => return null_default(ty),
        Some(r) => r,
    };

    if is_null_sentinel(raw, ty) {
        return null_default(ty);
    }

    match ty {
        PgType::Boolean => NormalizedValue::Value(coerce_boolean(raw).into_owned()),
        _ => NormalizedValue::Value(raw.to_string()),
    }
}

/// VARCHAR length metadata fallback: an unparsable or absent length falls
/// back to unsized `VARCHAR` (spec §4.3.4).
pub fn varchar_type_name(length: Option<u32>) -> String {
    match length {
        Some(n) if n > 0 => format!("VARCHAR({n})"),
        _ => "VARCHAR".to_string(),
    }
}

/// NUMERIC precision/scale fallback: precision or scale over 1000 is
/// replaced with `NUMERIC(18,4)` (spec §4.3.4).
pub fn numeric_type_name(precision: Option<u32>, scale: Option<u32>) -> String {
    match (precision, scale) {
        (Some(p), Some(s)) if p <= 1000 && s <= 1000 => format!("NUMERIC({p},{s})"),
        _ => "NUMERIC(18,4)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sentinels_map_to_type_default() {
        assert_eq!(normalize(Some(""), PgType::Text), NormalizedValue::Null);
        assert_eq!(
            normalize(Some("NULL"), PgType::Integer),
            NormalizedValue::Value("0".to_string())
        );
        assert_eq!(
            normalize(Some("null"), PgType::Boolean),
            NormalizedValue::Value("false".to_string())
        );
        assert_eq!(
            normalize(None, PgType::Timestamp),
            NormalizedValue::Value("1970-01-01 00:00:00".to_string())
        );
    }

    #[test]
    fn test_zero_dates_are_null_only_for_date_types() {
        assert_eq!(
            normalize(Some("0000-00-00"), PgType::Date),
            NormalizedValue::Value("1970-01-01".to_string())
        );
        assert_eq!(
            normalize(Some("1900-01-01"), PgType::Timestamp),
            NormalizedValue::Value("1970-01-01 00:00:00".to_string())
        );
        // Not a date column: the same literal text passes through unchanged.
        assert_eq!(
            normalize(Some("1900-01-01"), PgType::Text),
            NormalizedValue::Value("1900-01-01".to_string())
        );
    }

    #[test]
    fn test_control_bytes_become_null() {
        assert_eq!(
            normalize(Some("abc\u{0001}def"), PgType::Text),
            NormalizedValue::Null
        );
        // Tab/LF/CR are explicitly allowed.
        assert_eq!(
            normalize(Some("a\tb\nc\rd"), PgType::Text),
            NormalizedValue::Value("a\tb\nc\rd".to_string())
        );
    }

    #[test]
    fn test_boolean_coercion() {
        for (raw, expected) in [("N", "false"), ("0", "false"), ("Y", "true"), ("1", "true")] {
            assert_eq!(
                normalize(Some(raw), PgType::Boolean),
                NormalizedValue::Value(expected.to_string())
            );
        }
    }

    #[test]
    fn test_quote_passthrough_unescaped() {
        // Escaping for SQL-literal embedding is the writer's job
        // (`writer::quote_literal`), not the normalizer's — a normalized
        // value is a semantic value, not a SQL fragment.
        assert_eq!(
            normalize(Some("O'Brien"), PgType::Text),
            NormalizedValue::Value("O'Brien".to_string())
        );
    }

    #[test]
    fn test_idempotence_p6() {
        for (raw, ty) in [
            (Some("hello"), PgType::Text),
            (Some("42"), PgType::Integer),
            (Some(""), PgType::Numeric),
            (None, PgType::Boolean),
        ] {
            let once = normalize(raw, ty);
            let value_str = match &once {
                NormalizedValue::Null => None,
                NormalizedValue::Value(v) => Some(v.as_str()),
            };
            let twice = normalize(value_str, ty);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_varchar_fallback() {
        assert_eq!(varchar_type_name(Some(255)), "VARCHAR(255)");
        assert_eq!(varchar_type_name(None), "VARCHAR");
        assert_eq!(varchar_type_name(Some(0)), "VARCHAR");
    }

    #[test]
    fn test_numeric_fallback_over_limit() {
        assert_eq!(numeric_type_name(Some(10), Some(2)), "NUMERIC(10,2)");
        assert_eq!(numeric_type_name(Some(2000), Some(2)), "NUMERIC(18,4)");
        assert_eq!(numeric_type_name(None, None), "NUMERIC(18,4)");
    }
}
