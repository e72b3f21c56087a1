//! Proptest generators for property-based testing.

use proptest::prelude::*;

use trustwire_core::{CategoryRules, PermissionCategory, PermissionSet};

/// Generate a glob pattern over short property paths.
pub fn pattern() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z]{1,6}/\\*".prop_map(String::from),
        "[a-z]{1,6}/[a-z]{1,6}".prop_map(String::from),
        "[a-z]{1,4}_\\*".prop_map(String::from),
        Just("*".to_string()),
    ]
}

/// Generate an operation name.
pub fn operation() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("read".to_string()),
        Just("write".to_string()),
        Just("delete".to_string()),
        Just("subscribe".to_string()),
    ]
}

fn pattern_list() -> impl Strategy<Value = Option<Vec<String>>> {
    prop::option::of(prop::collection::vec(pattern(), 0..4))
}

/// Generate rules for one category, with every field independently set or
/// unset.
pub fn category_rules() -> impl Strategy<Value = CategoryRules> {
    (
        pattern_list(),
        pattern_list(),
        prop::option::of(prop::collection::vec(operation(), 0..3)),
        pattern_list(),
        pattern_list(),
    )
        .prop_map(|(patterns, excluded_patterns, operations, allowed, denied)| CategoryRules {
            patterns,
            excluded_patterns,
            operations,
            allowed,
            denied,
        })
}

/// Generate a permission set with each category independently present.
pub fn permission_set() -> impl Strategy<Value = PermissionSet> {
    prop::collection::vec(prop::option::of(category_rules()), PermissionCategory::ALL.len()).prop_map(
        |rules| {
            let mut set = PermissionSet::new();
            for (category, rules) in PermissionCategory::ALL.into_iter().zip(rules) {
                set.set(category, rules);
            }
            set
        },
    )
}

/// Generate a delivery order for sequences `first..first + len`.
pub fn sequence_permutation(first: u64, len: usize) -> impl Strategy<Value = Vec<u64>> {
    Just((first..first + len as u64).collect::<Vec<_>>()).prop_shuffle()
}

/// Generate a delivery order with some sequences repeated, as an
/// at-least-once transport would produce.
pub fn delivery_with_duplicates(first: u64, len: usize) -> impl Strategy<Value = Vec<u64>> {
    (
        sequence_permutation(first, len),
        prop::collection::vec(first..first + len as u64, 0..len),
    )
        .prop_flat_map(|(order, extra)| {
            let mut all = order;
            all.extend(extra);
            Just(all).prop_shuffle()
        })
}
