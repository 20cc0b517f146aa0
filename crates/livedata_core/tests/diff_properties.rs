//! Properties of the ordered snapshot diff.

use livedata_core::{apply_changes, diff_ordered, Change};
use livedata_testkit::generators::{
    single_move_strategy, snapshot_pair_strategy, snapshot_strategy,
};
use proptest::prelude::*;

proptest! {
    #[test]
    fn identical_snapshots_produce_no_changes(docs in snapshot_strategy(0..=12)) {
        let outcome = diff_ordered(&docs, &docs).unwrap();
        prop_assert!(outcome.is_empty());
        prop_assert!(!outcome.slow_mode);
    }

    #[test]
    fn replaying_changes_converges((old, new) in snapshot_pair_strategy(12)) {
        let outcome = diff_ordered(&old, &new).unwrap();
        let mut replay = old.clone();
        apply_changes(&mut replay, &outcome.changes).unwrap();
        prop_assert_eq!(replay, new);
    }

    #[test]
    fn changes_are_bounded_by_the_documents_involved((old, new) in snapshot_pair_strategy(12)) {
        let outcome = diff_ordered(&old, &new).unwrap();
        let (mut added, mut changed, mut moved, mut removed) = (0, 0, 0, 0);
        for change in &outcome.changes {
            match change {
                Change::Added { .. } => added += 1,
                Change::Changed { .. } => changed += 1,
                Change::Moved { .. } => moved += 1,
                Change::Removed { .. } => removed += 1,
            }
        }
        prop_assert!(removed <= old.len(), "{} removed of {}", removed, old.len());
        prop_assert!(added <= new.len(), "{} added of {}", added, new.len());
        prop_assert!(moved <= new.len(), "{} moved of {}", moved, new.len());
        prop_assert!(changed <= new.len(), "{} changed of {}", changed, new.len());
    }

    #[test]
    fn an_edited_document_moves_once((old, new) in single_move_strategy(10)) {
        let outcome = diff_ordered(&old, &new).unwrap();
        prop_assert!(!outcome.slow_mode);
        prop_assert_eq!(outcome.changes.len(), 2);
        let changed = matches!(outcome.changes[0], Change::Changed { .. });
        let moved = matches!(outcome.changes[1], Change::Moved { .. });
        prop_assert!(changed && moved, "{:?}", outcome.changes);
    }

    #[test]
    fn reordering_unchanged_documents_uses_slow_mode(old in snapshot_strategy(0..=8)) {
        let mut shuffled = old.clone();
        shuffled.reverse();
        let outcome = diff_ordered(&old, &shuffled).unwrap();
        prop_assert_eq!(outcome.slow_mode, old.len() > 1);
        let mut replay = old.clone();
        apply_changes(&mut replay, &outcome.changes).unwrap();
        prop_assert_eq!(replay, shuffled);
    }
}
