//! Property-based coverage for spec §8 P6: normalisation is idempotent
//! for every value and target type.

use lakesync::normalize::{normalize, NormalizedValue, PgType};
use proptest::prelude::*;

fn arb_pg_type() -> impl Strategy<Value = PgType> {
    prop_oneof![
        Just(PgType::Text),
        Just(PgType::Integer),
        Just(PgType::Bigint),
        Just(PgType::Numeric),
        Just(PgType::Boolean),
        Just(PgType::Timestamp),
        Just(PgType::Date),
        Just(PgType::Time),
        Just(PgType::Bytea),
        Just(PgType::Jsonb),
    ]
}

fn normalized_to_option(v: NormalizedValue) -> Option<String> {
    match v {
        NormalizedValue::Null => None,
        NormalizedValue::Value(s) => Some(s),
    }
}

proptest! {
    #[test]
    fn normalize_is_idempotent(raw in ".{0,32}", ty in arb_pg_type()) {
        let once = normalize(Some(raw.as_str()), ty);
        let once_str = normalized_to_option(once.clone());
        let twice = normalize(once_str.as_deref(), ty);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn normalize_of_none_is_idempotent(ty in arb_pg_type()) {
        let once = normalize(None, ty);
        let once_str = normalized_to_option(once.clone());
        let twice = normalize(once_str.as_deref(), ty);
        prop_assert_eq!(once, twice);
    }
}
