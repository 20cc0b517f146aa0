//! Property-based test generators using proptest.
//!
//! Snapshots are ordered vectors of documents with unique `_id`s and an
//! integer `x` field, the shape live query results have.

use livedata_store::Document;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Strategy for document ids drawn from a small pool, so two snapshots
/// generated independently share many ids.
pub fn document_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]").expect("Invalid regex")
}

fn to_documents(fields: BTreeMap<String, i64>) -> Vec<Document> {
    fields
        .into_iter()
        .map(|(id, x)| {
            Document::try_from(json!({"_id": id, "x": x})).expect("object literal")
        })
        .collect()
}

/// Strategy for a snapshot of `sizes` documents in arbitrary order.
pub fn snapshot_strategy(sizes: RangeInclusive<usize>) -> impl Strategy<Value = Vec<Document>> {
    prop::collection::btree_map(document_id_strategy(), -20i64..20, sizes)
        .prop_map(to_documents)
        .prop_shuffle()
}

/// Strategy for an (old, new) pair of snapshots over a shared id pool.
///
/// Covers additions, removals, content changes and reorderings at once.
pub fn snapshot_pair_strategy(
    max_len: usize,
) -> impl Strategy<Value = (Vec<Document>, Vec<Document>)> {
    (snapshot_strategy(0..=max_len), snapshot_strategy(0..=max_len))
}

/// Strategy for an (old, new) pair where `new` is `old` with exactly one
/// document edited and moved to a different position.
pub fn single_move_strategy(
    max_len: usize,
) -> impl Strategy<Value = (Vec<Document>, Vec<Document>)> {
    snapshot_strategy(2..=max_len.max(2))
        .prop_flat_map(|old| {
            let len = old.len();
            (Just(old), 0..len, 0..len)
        })
        .prop_filter("document must actually move", |(_, from, to)| from != to)
        .prop_map(|(old, from, to)| {
            let mut new = old.clone();
            let mut doc = new.remove(from);
            let x = doc.get("x").and_then(Value::as_i64).unwrap_or_default();
            doc.insert("x", json!(x + 100));
            new.insert(to, doc);
            (old, new)
        })
}

/// Strategy for selectors that must match nothing.
pub fn falsy_selector_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        Just(json!(false)),
        Just(json!(0)),
        Just(json!("")),
        Just(json!({"_id": null})),
        Just(json!({"_id": ""})),
        Just(json!({"_id": false})),
    ]
}
