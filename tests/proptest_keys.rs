//! Property-based tests for query keys.
//!
//! # Properties Tested
//!
//! 1. **Structural equality**: keys built from equal segments are equal and
//!    hash alike, however they were built
//! 2. **Order sensitivity**: swapping two distinct segments changes the key
//! 3. **Prefix matching**: every key starts with each of its own prefixes
//! 4. **Serde shape**: a key serializes as the plain array of its segments

use proptest::prelude::*;
use query_kit::{query_key, QueryKey};
use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

fn segment() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[a-z-]{1,12}".prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
    ]
}

fn hash_of(key: &QueryKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

#[derive(Serialize)]
struct Filter {
    page: u32,
    search: String,
}

proptest! {
    #[test]
    fn prop_equal_segments_equal_keys(segments in prop::collection::vec(segment(), 0..6)) {
        let from_vec = QueryKey::from_segments(segments.clone());
        let built = segments
            .iter()
            .cloned()
            .fold(QueryKey::new(), |key, s| key.segment(s));

        prop_assert_eq!(&from_vec, &built);
        prop_assert_eq!(hash_of(&from_vec), hash_of(&built));
    }

    #[test]
    fn prop_order_matters(
        segments in prop::collection::vec(segment(), 2..6),
        i in 0usize..6,
        j in 0usize..6,
    ) {
        let i = i % segments.len();
        let j = j % segments.len();
        prop_assume!(segments[i] != segments[j]);

        let mut swapped = segments.clone();
        swapped.swap(i, j);

        prop_assert_ne!(QueryKey::from_segments(segments), QueryKey::from_segments(swapped));
    }

    #[test]
    fn prop_key_starts_with_its_prefixes(
        segments in prop::collection::vec(segment(), 0..6),
        cut in 0usize..7,
    ) {
        let cut = cut.min(segments.len());
        let key = QueryKey::from_segments(segments.clone());
        let prefix = QueryKey::from_segments(segments[..cut].to_vec());

        prop_assert!(key.starts_with(&prefix));
        prop_assert!(key.starts_with(&QueryKey::new()));
    }

    #[test]
    fn prop_serializes_as_segment_array(segments in prop::collection::vec(segment(), 0..6)) {
        let key = QueryKey::from_segments(segments.clone());
        let json = serde_json::to_value(&key).unwrap();
        prop_assert_eq!(json, Value::Array(segments));
    }

    #[test]
    fn prop_structured_segments(page in any::<u32>(), search in "[a-z ]{0,16}") {
        let a = query_key!["super-heroes"]
            .try_segment(&Filter { page, search: search.clone() })
            .unwrap();
        let b = query_key!["super-heroes"]
            .try_segment(&Filter { page, search })
            .unwrap();

        prop_assert_eq!(&a, &b);
        prop_assert!(a.starts_with(&query_key!["super-heroes"]));
    }
}

#[test]
fn test_longer_prefix_does_not_match() {
    let key = query_key!["super-hero", 1];
    assert!(!key.starts_with(&query_key!["super-hero", 1, "friends"]));
    assert!(!key.starts_with(&query_key!["villain"]));
}
