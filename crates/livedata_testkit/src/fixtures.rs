//! Test fixtures and connection helpers.
//!
//! Provides in-memory connections, callback recorders and the canonical
//! observe scenario.

use livedata_core::{Config, Connection, ObserveCallbacks, WriteFence};
use livedata_store::{new_document_id, Document, MemoryStore};
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Collection used by the fixtures and scenarios.
pub const TEST_COLLECTION: &str = "livedata_test_collection";

/// Configuration with a short throttle window so tests don't wait long.
pub fn quick_config() -> Config {
    Config::new().poll_throttle(Duration::from_millis(5))
}

/// A connection to a fresh in-memory store.
pub struct TestConnection {
    /// The connection.
    pub conn: Connection,
    /// The store behind it, for direct inspection.
    pub store: Arc<MemoryStore>,
}

impl TestConnection {
    /// Creates a connection to an empty store with [`quick_config`].
    pub fn memory() -> Self {
        Self::with_store(MemoryStore::new(), quick_config())
    }

    /// Creates a connection to a store that reorders ties on every find.
    pub fn unstable() -> Self {
        Self::with_store(MemoryStore::with_unstable_order(), quick_config())
    }

    /// Creates a connection to `store`.
    pub fn with_store(store: MemoryStore, config: Config) -> Self {
        let store = Arc::new(store);
        let conn = Connection::with_config(store.clone(), config);
        Self { conn, store }
    }
}

impl std::ops::Deref for TestConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

/// Returns a fresh value for scoping one test's documents.
pub fn run_id() -> String {
    new_document_id()
}

/// Builds a document from a JSON object.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn doc(value: Value) -> Document {
    Document::try_from(value).expect("test document must be a JSON object")
}

/// Runs `future` inside a new write fence and waits for it to fire.
pub async fn fenced<F: Future>(future: F) -> F::Output {
    WriteFence::new().run(future).await
}

fn render(doc: &Document, field: &str) -> String {
    match doc.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
        None => "?".to_string(),
    }
}

/// Records callbacks as a compact string such as `a(1,0)c(3,0,1)`.
///
/// Each document is rendered by one field.
#[derive(Clone)]
pub struct CallbackLog {
    field: Arc<str>,
    entries: Arc<Mutex<String>>,
}

impl CallbackLog {
    /// Creates a log rendering documents by `field`.
    pub fn new(field: &str) -> Self {
        Self {
            field: Arc::from(field),
            entries: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Returns callbacks that append to this log.
    pub fn callbacks(&self) -> ObserveCallbacks {
        let (added, changed, moved, removed) =
            (self.clone(), self.clone(), self.clone(), self.clone());
        ObserveCallbacks::new()
            .added(move |doc, before| {
                let x = render(doc, &added.field);
                added.entries.lock().push_str(&format!("a({x},{before})"));
            })
            .changed(move |doc, at, old| {
                let (x, was) = (render(doc, &changed.field), render(old, &changed.field));
                changed.entries.lock().push_str(&format!("c({x},{at},{was})"));
            })
            .moved(move |doc, from, to| {
                let x = render(doc, &moved.field);
                moved.entries.lock().push_str(&format!("m({x},{from},{to})"));
            })
            .removed(move |doc, at| {
                let x = render(doc, &removed.field);
                removed.entries.lock().push_str(&format!("r({x},{at})"));
            })
    }

    /// Returns the log and clears it.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.entries.lock())
    }
}

/// Number of callbacks of each kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackCounters {
    /// `added` calls.
    pub added: u64,
    /// `changed` calls.
    pub changed: u64,
    /// `moved` calls.
    pub moved: u64,
    /// `removed` calls.
    pub removed: u64,
}

impl CallbackCounters {
    /// Returns true if no counter exceeds the matching one in `max`.
    pub fn within(&self, max: &CallbackCounters) -> bool {
        self.added <= max.added
            && self.changed <= max.changed
            && self.moved <= max.moved
            && self.removed <= max.removed
    }
}

#[derive(Default)]
struct ReplayState {
    docs: Vec<Document>,
    counters: CallbackCounters,
    violations: Vec<String>,
}

/// Maintains a copy of a live query's results purely from its callbacks.
///
/// Every callback is checked against the copy (the document it names must
/// be where it says); mismatches are recorded as violations rather than
/// panicking inside the poller.
#[derive(Clone, Default)]
pub struct ReplayArray {
    state: Arc<Mutex<ReplayState>>,
}

impl ReplayArray {
    /// Creates an empty replay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns callbacks that apply to this replay.
    pub fn callbacks(&self) -> ObserveCallbacks {
        let (added, changed, moved, removed) =
            (self.clone(), self.clone(), self.clone(), self.clone());
        ObserveCallbacks::new()
            .added(move |doc, before| {
                let mut guard = added.state.lock();
                let state = &mut *guard;
                state.counters.added += 1;
                if before > state.docs.len() {
                    let len = state.docs.len();
                    state.violations.push(format!("added at {before} past end {len}"));
                    state.docs.push(doc.clone());
                } else {
                    state.docs.insert(before, doc.clone());
                }
            })
            .changed(move |doc, at, old| {
                let mut guard = changed.state.lock();
                let state = &mut *guard;
                state.counters.changed += 1;
                match state.docs.get_mut(at) {
                    Some(slot) if *slot == *old => *slot = doc.clone(),
                    _ => state
                        .violations
                        .push(format!("changed {:?} not found at {at}", old.id())),
                }
            })
            .moved(move |doc, from, to| {
                let mut guard = moved.state.lock();
                let state = &mut *guard;
                state.counters.moved += 1;
                let len = state.docs.len();
                if state.docs.get(from).map(Document::id) != Some(doc.id()) || to >= len {
                    state
                        .violations
                        .push(format!("moved {:?} from {from} to {to} of {len}", doc.id()));
                    return;
                }
                let item = state.docs.remove(from);
                state.docs.insert(to, item);
            })
            .removed(move |doc, at| {
                let mut guard = removed.state.lock();
                let state = &mut *guard;
                state.counters.removed += 1;
                if state.docs.get(at) == Some(doc) {
                    state.docs.remove(at);
                } else {
                    state
                        .violations
                        .push(format!("removed {:?} not found at {at}", doc.id()));
                }
            })
    }

    /// Returns the replayed documents.
    pub fn documents(&self) -> Vec<Document> {
        self.state.lock().docs.clone()
    }

    /// Returns one field of every replayed document, in order.
    pub fn values(&self, field: &str) -> Vec<Value> {
        self.state
            .lock()
            .docs
            .iter()
            .map(|d| d.get(field).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Returns the callback counters.
    pub fn counters(&self) -> CallbackCounters {
        self.state.lock().counters
    }

    /// Returns every inconsistency seen so far.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }
}

/// Ready-made observe scenarios.
pub mod scenarios {
    use super::*;
    use livedata_core::LiveResult;
    use livedata_store::{FindOptions, Modifier, SortOrder, UpdateOptions};
    use serde_json::json;

    /// One fenced batch of writes and the callbacks it produced.
    #[derive(Debug, Clone)]
    pub struct ScenarioStep {
        /// What the batch does.
        pub name: &'static str,
        /// Acceptable callback logs.
        pub expected: &'static [&'static str],
        /// The log actually produced.
        pub log: String,
    }

    impl ScenarioStep {
        /// Returns true if the produced log is one of the expected ones.
        pub fn matches(&self) -> bool {
            self.expected.contains(&self.log.as_str())
        }
    }

    /// Runs the insert / update / remove walkthrough against a live query
    /// sorted by `x`, returning every step's callback log.
    pub async fn basics(conn: &Connection) -> LiveResult<Vec<ScenarioStep>> {
        let run = run_id();
        let log = CallbackLog::new("x");
        let by_x = FindOptions::new().sort_by("x", SortOrder::Ascending);
        let query = conn
            .find(TEST_COLLECTION, json!({ "run": run }), by_x)?
            .observe(log.callbacks())
            .await?;

        let mut steps = Vec::new();
        let mut record = |name: &'static str,
                          expected: &'static [&'static str],
                          log: &CallbackLog| {
            steps.push(ScenarioStep {
                name,
                expected,
                log: log.take(),
            });
        };

        fenced(conn.insert(TEST_COLLECTION, doc(json!({"run": run, "x": 1})))).await?;
        record("insert x=1", &["a(1,0)"], &log);

        fenced(conn.insert(TEST_COLLECTION, doc(json!({"run": run, "x": 4})))).await?;
        record("insert x=4", &["a(4,1)"], &log);

        fenced(conn.update(
            TEST_COLLECTION,
            json!({ "run": run }),
            Modifier::inc("x", 2),
            UpdateOptions::new().multi(true),
        ))
        .await?;
        record("increment every x by 2", &["c(3,0,1)c(6,1,4)"], &log);

        fenced(conn.update(
            TEST_COLLECTION,
            json!({"run": run, "x": 3}),
            Modifier::inc("x", 10),
            UpdateOptions::new().multi(true),
        ))
        .await?;
        record(
            "increment x=3 by 10",
            &["c(13,0,3)m(13,0,1)", "m(6,1,0)c(13,1,3)"],
            &log,
        );

        fenced(conn.remove(TEST_COLLECTION, json!({"run": run, "x": {"$gt": 10}}))).await?;
        record("remove x > 10", &["r(13,1)"], &log);

        fenced(conn.remove(TEST_COLLECTION, json!({ "run": run }))).await?;
        record("remove the rest", &["r(6,0)"], &log);

        query.stop();
        Ok(steps)
    }
}
