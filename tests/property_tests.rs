//! Property tests for the normalization and canonicalization laws:
//! every normalizer is idempotent, and the cache key is stable under
//! formatting-only edits.

use proptest::prelude::*;
use specforge::ir::{ConstraintValue, FieldConstraint, ValidationType};
use specforge::lowering::cache::IrCache;
use specforge::lowering::normalize;

fn arb_validation_type() -> impl Strategy<Value = ValidationType> {
    prop_oneof![
        Just(ValidationType::RangeMin),
        Just(ValidationType::RangeMax),
        Just(ValidationType::Pattern),
        Just(ValidationType::LengthMin),
        Just(ValidationType::LengthMax),
        Just(ValidationType::Presence),
        Just(ValidationType::Uniqueness),
        Just(ValidationType::Enumeration),
    ]
}

fn arb_constraint_value() -> impl Strategy<Value = ConstraintValue> {
    prop_oneof![
        any::<bool>().prop_map(ConstraintValue::Bool),
        any::<i32>().prop_map(|i| ConstraintValue::Int(i64::from(i))),
        (-1.0e6f64..1.0e6).prop_map(ConstraintValue::Float),
        "[ -~]{0,32}".prop_map(ConstraintValue::Str),
        proptest::collection::vec("[a-z]{1,8}", 0..4).prop_map(ConstraintValue::List),
    ]
}

proptest! {
    #[test]
    fn normalize_constraint_is_idempotent(
        kind in arb_validation_type(),
        value in arb_constraint_value(),
    ) {
        let once = normalize::normalize_constraint(FieldConstraint::new(kind, value));
        let twice = normalize::normalize_constraint(once.clone());
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn snake_case_is_idempotent(raw in "[ -~]{0,48}") {
        let once = normalize::to_snake_case(&raw);
        prop_assert_eq!(normalize::to_snake_case(&once), once);
    }

    #[test]
    fn pascal_case_is_idempotent(raw in "[ -~]{0,48}") {
        let once = normalize::to_pascal_case(&raw);
        prop_assert_eq!(normalize::to_pascal_case(&once), once);
    }

    #[test]
    fn spec_canonicalization_is_idempotent(raw in "[ -~\n\r\t]{0,256}") {
        let once = normalize::canonicalize_spec(&raw);
        prop_assert_eq!(normalize::canonicalize_spec(&once), once);
    }

    #[test]
    fn cache_key_ignores_trailing_whitespace(
        body in "[a-z ]{1,64}",
        padding in "[ \t]{0,8}",
    ) {
        let canonical_a = normalize::canonicalize_spec(&body);
        let canonical_b = normalize::canonicalize_spec(&format!("{body}{padding}\n\n\n"));
        prop_assert_eq!(
            IrCache::key(&canonical_a, "fp"),
            IrCache::key(&canonical_b, "fp")
        );
    }

    #[test]
    fn operation_normalization_is_idempotent(raw in "[a-zA-Z_]{1,24}") {
        let once = normalize::normalize_operation(&raw);
        prop_assert_eq!(normalize::normalize_operation(&once), once);
    }
}
