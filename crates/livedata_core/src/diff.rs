//! Ordered diff between two result snapshots.
//!
//! [`diff_ordered`] turns an old ordered snapshot into a new one and
//! reports every step as a [`Change`]. Replaying the changes in order
//! against the old snapshot yields the new snapshot exactly; indices in
//! each change refer to the array as mutated by the changes before it.
//!
//! The store is not trusted to return documents in a stable order. When
//! documents that did not change appear in a different relative order,
//! the diff falls back to *slow mode* and repositions every document.
//! That costs extra notifications but never produces a wrong result.

use crate::error::DiffError;
use livedata_store::Document;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// One step in transforming the old snapshot into the new one.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// `doc` was inserted before index `before`.
    Added {
        /// The new document.
        doc: Document,
        /// Insertion index.
        before: usize,
    },
    /// The document at `at` was replaced by `doc`.
    Changed {
        /// The new version.
        doc: Document,
        /// Current index.
        at: usize,
        /// The previous version.
        old: Document,
    },
    /// `doc` moved from index `from` to index `to`.
    Moved {
        /// The moved document.
        doc: Document,
        /// Index before the move.
        from: usize,
        /// Index after the move.
        to: usize,
    },
    /// `doc` was removed from index `at`.
    Removed {
        /// The removed document.
        doc: Document,
        /// Index it was removed from.
        at: usize,
    },
}

/// Result of diffing two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffOutcome {
    /// Changes in replay order.
    pub changes: Vec<Change>,
    /// Whether the unstable-order fallback was used.
    pub slow_mode: bool,
}

impl DiffOutcome {
    /// Returns true if the snapshots were identical.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

fn index_by_id(docs: &[Document]) -> Result<HashMap<&str, &Document>, DiffError> {
    let mut by_id = HashMap::with_capacity(docs.len());
    for (index, doc) in docs.iter().enumerate() {
        let id = doc.id().ok_or(DiffError::MissingId { index })?;
        if by_id.insert(id, doc).is_some() {
            return Err(DiffError::DuplicateKey { id: id.to_string() });
        }
    }
    Ok(by_id)
}

fn position(results: &[Document], id: &str) -> Result<usize, DiffError> {
    results
        .iter()
        .position(|doc| doc.id() == Some(id))
        .ok_or_else(|| DiffError::MissingDocument { id: id.to_string() })
}

fn id_of(doc: &Document) -> &str {
    // Every document was checked by `index_by_id` before use.
    doc.id().unwrap_or_default()
}

/// Computes the changes that turn `old` into `new`.
///
/// # Errors
///
/// Returns a [`DiffError`] if either snapshot is malformed (missing or
/// duplicate keys) or an internal invariant fails. No partial result is
/// returned in that case.
pub fn diff_ordered(old: &[Document], new: &[Document]) -> Result<DiffOutcome, DiffError> {
    let old_by_id = index_by_id(old)?;
    let new_by_id = index_by_id(new)?;

    let mut changes = Vec::new();
    let mut results: Vec<Document> = old.to_vec();

    // Removals first; they never disturb the order of what remains.
    let mut i = 0;
    while i < results.len() {
        if new_by_id.contains_key(id_of(&results[i])) {
            i += 1;
        } else {
            let doc = results.remove(i);
            changes.push(Change::Removed { doc, at: i });
        }
    }

    // Documents that are new or changed need an explicit position.
    let mut needs_position: HashSet<&str> = new
        .iter()
        .filter(|doc| old_by_id.get(id_of(doc)) != Some(doc))
        .map(id_of)
        .collect();

    // Everything else should appear in the same relative order on both
    // sides. If not, the store's ordering is unstable.
    let slow_mode = !stable_order(&results, new, &needs_position)?;
    if slow_mode {
        warn!(
            documents = new.len(),
            "result order is unstable; repositioning every document"
        );
        needs_position.extend(new.iter().map(id_of));
    }

    // Place each document right after the nearest preceding document that
    // is already in position. Walking `new` front to back means that
    // anchor is always the immediate predecessor.
    for (new_offset, doc) in new.iter().enumerate() {
        let id = id_of(doc);
        if !needs_position.contains(id) {
            continue;
        }

        let anchor = new[..new_offset]
            .iter()
            .rev()
            .map(id_of)
            .find(|candidate| !needs_position.contains(candidate));

        match old_by_id.get(id) {
            None => {
                let before = match anchor {
                    Some(anchor) => position(&results, anchor)? + 1,
                    None => 0,
                };
                changes.push(Change::Added {
                    doc: doc.clone(),
                    before,
                });
                results.insert(before, doc.clone());
            }
            Some(&old_doc) => {
                let from = position(&results, id)?;
                let to = match anchor {
                    None => 0,
                    Some(anchor) => {
                        let after_anchor = position(&results, anchor)? + 1;
                        // Removing the document first shifts the anchor left.
                        if from < after_anchor {
                            after_anchor - 1
                        } else {
                            after_anchor
                        }
                    }
                };

                if old_doc != doc {
                    changes.push(Change::Changed {
                        doc: doc.clone(),
                        at: from,
                        old: old_doc.clone(),
                    });
                    results[from] = doc.clone();
                }
                if from != to {
                    changes.push(Change::Moved {
                        doc: doc.clone(),
                        from,
                        to,
                    });
                    let moved = results.remove(from);
                    results.insert(to, moved);
                }
            }
        }

        needs_position.remove(id);
    }

    if results.as_slice() != new {
        let id = results
            .iter()
            .zip(new)
            .find(|(have, want)| have != want)
            .map_or_else(|| String::from("<tail>"), |(_, want)| id_of(want).to_string());
        return Err(DiffError::MissingDocument { id });
    }

    Ok(DiffOutcome { changes, slow_mode })
}

/// Lock-step walk over both sides, skipping documents that need
/// positioning. Returns false as soon as the remaining keys disagree.
fn stable_order(
    results: &[Document],
    new: &[Document],
    needs_position: &HashSet<&str>,
) -> Result<bool, DiffError> {
    let stable = |doc: &&Document| !needs_position.contains(id_of(doc));
    let mut old_stable = results.iter().filter(stable);
    let mut new_stable = new.iter().filter(stable);

    loop {
        match (old_stable.next(), new_stable.next()) {
            (None, None) => return Ok(true),
            (Some(a), Some(b)) => {
                if id_of(a) != id_of(b) {
                    return Ok(false);
                }
            }
            (a, b) => {
                let old_left = usize::from(a.is_some()) + old_stable.count();
                let new_left = usize::from(b.is_some()) + new_stable.count();
                return Err(DiffError::LengthMismatch {
                    old: old_left,
                    new: new_left,
                });
            }
        }
    }
}

/// Replays changes onto `base`, checking each one against the array.
///
/// # Errors
///
/// Returns [`DiffError::MissingDocument`] if a change refers to an index
/// that does not hold the expected document.
pub fn apply_changes(base: &mut Vec<Document>, changes: &[Change]) -> Result<(), DiffError> {
    let missing = |doc: &Document| DiffError::MissingDocument {
        id: doc.id().unwrap_or_default().to_string(),
    };

    for change in changes {
        match change {
            Change::Added { doc, before } => {
                if *before > base.len() {
                    return Err(missing(doc));
                }
                base.insert(*before, doc.clone());
            }
            Change::Changed { doc, at, old } => {
                match base.get_mut(*at) {
                    Some(slot) if *slot == *old => *slot = doc.clone(),
                    _ => return Err(missing(old)),
                }
            }
            Change::Moved { doc, from, to } => {
                if base.get(*from).map(Document::id) != Some(doc.id()) || *to >= base.len() {
                    return Err(missing(doc));
                }
                let moved = base.remove(*from);
                base.insert(*to, moved);
            }
            Change::Removed { doc, at } => {
                if base.get(*at) != Some(doc) {
                    return Err(missing(doc));
                }
                base.remove(*at);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(id: &str, x: i64) -> Document {
        Document::try_from(json!({"_id": id, "x": x})).unwrap()
    }

    /// Compact `a(x,before)` / `c(x,at,old)` / `m(x,from,to)` / `r(x,at)` log.
    fn log(changes: &[Change]) -> String {
        let x = |doc: &Document| doc.get("x").and_then(|v| v.as_i64()).unwrap();
        changes
            .iter()
            .map(|change| match change {
                Change::Added { doc, before } => format!("a({},{})", x(doc), before),
                Change::Changed { doc, at, old } => format!("c({},{},{})", x(doc), at, x(old)),
                Change::Moved { doc, from, to } => format!("m({},{},{})", x(doc), from, to),
                Change::Removed { doc, at } => format!("r({},{})", x(doc), at),
            })
            .collect()
    }

    fn check(old: &[Document], new: &[Document]) -> DiffOutcome {
        let outcome = diff_ordered(old, new).unwrap();
        let mut replay = old.to_vec();
        apply_changes(&mut replay, &outcome.changes).unwrap();
        assert_eq!(replay, new);
        outcome
    }

    #[test]
    fn identical_snapshots_produce_nothing() {
        let docs = vec![d("a", 1), d("b", 2)];
        let outcome = check(&docs, &docs);
        assert!(outcome.is_empty());
        assert!(!outcome.slow_mode);
    }

    #[test]
    fn adds_in_order() {
        let outcome = check(&[], &[d("a", 1), d("b", 4)]);
        assert_eq!(log(&outcome.changes), "a(1,0)a(4,1)");
    }

    #[test]
    fn in_place_changes() {
        let outcome = check(&[d("a", 1), d("b", 4)], &[d("a", 3), d("b", 6)]);
        assert_eq!(log(&outcome.changes), "c(3,0,1)c(6,1,4)");
    }

    #[test]
    fn change_and_move_to_end() {
        let outcome = check(&[d("a", 3), d("b", 6)], &[d("b", 6), d("a", 13)]);
        assert_eq!(log(&outcome.changes), "c(13,0,3)m(13,0,1)");
    }

    #[test]
    fn removals_come_first() {
        let outcome = check(&[d("a", 1), d("b", 2), d("c", 3)], &[d("b", 2), d("d", 0)]);
        assert_eq!(log(&outcome.changes), "r(1,0)r(3,1)a(0,1)");
    }

    #[test]
    fn two_changes_with_moves() {
        let old = vec![d("a", 10), d("b", 15), d("c", 20), d("d", 25), d("e", 30)];
        let new = vec![d("c", 0), d("b", 15), d("d", 25), d("e", 30), d("a", 35)];
        let outcome = check(&old, &new);
        assert_eq!(log(&outcome.changes), "c(0,2,20)m(0,2,0)c(35,1,10)m(35,1,4)");
        assert!(!outcome.slow_mode);
    }

    #[test]
    fn single_move_is_one_notification() {
        let old: Vec<_> = (0..50).map(|i| d(&format!("k{i}"), i)).collect();
        let mut new = old.clone();
        let moved = new.remove(3);
        let moved = Document::try_from(json!({"_id": moved.id().unwrap(), "x": 1000})).unwrap();
        new.push(moved);

        let outcome = check(&old, &new);
        let moves = outcome
            .changes
            .iter()
            .filter(|c| matches!(c, Change::Moved { .. }))
            .count();
        assert_eq!(moves, 1);
        assert_eq!(outcome.changes.len(), 2);
    }

    #[test]
    fn reordering_unchanged_documents_triggers_slow_mode() {
        let old = vec![d("a", 1), d("b", 1), d("c", 1)];
        let new = vec![d("b", 1), d("c", 1), d("a", 1)];
        let outcome = check(&old, &new);
        assert!(outcome.slow_mode);
        assert!(outcome
            .changes
            .iter()
            .all(|c| matches!(c, Change::Moved { .. })));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let result = diff_ordered(&[], &[d("a", 1), d("a", 2)]);
        assert_eq!(result, Err(DiffError::DuplicateKey { id: "a".into() }));
    }

    #[test]
    fn missing_ids_are_rejected() {
        let bad = Document::try_from(json!({"x": 1})).unwrap();
        let result = diff_ordered(&[d("a", 1)], &[bad]);
        assert_eq!(result, Err(DiffError::MissingId { index: 0 }));
    }

    #[test]
    fn apply_rejects_mismatched_change() {
        let mut base = vec![d("a", 1)];
        let changes = vec![Change::Removed { doc: d("b", 2), at: 0 }];
        assert!(apply_changes(&mut base, &changes).is_err());
    }
}
