//! Live queries.
//!
//! A live query keeps an ordered snapshot of a cursor's results and turns
//! every change to it into `added` / `changed` / `moved` / `removed`
//! callbacks. It re-polls the store when:
//! - one of its invalidation keys is fired on the crossbar
//! - the refresh interval elapses
//!
//! # Polling
//!
//! Dirty signals are coalesced: at most one poll runs at a time, and a
//! signal arriving while one is running or scheduled only sets a flag. A
//! scheduled poll starts after the configured throttle window, so a burst
//! of writes produces one poll.
//!
//! # Write fences
//!
//! An invalidation delivered inside a [`WriteFence`] scope registers a
//! write on that fence. The token is committed only after the first poll
//! that *started after* the invalidation has delivered its callbacks, so a
//! writer waiting on the fence observes its own writes.

use crate::config::Config;
use crate::connection::Connection;
use crate::crossbar::ListenerHandle;
use crate::cursor::CursorDescription;
use crate::diff::{diff_ordered, Change};
use crate::error::{LiveError, LiveResult};
use crate::fence::{WriteFence, WriteToken};
use livedata_store::Document;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type AddedFn = dyn Fn(&Document, usize) + Send + Sync;
type ChangedFn = dyn Fn(&Document, usize, &Document) + Send + Sync;
type MovedFn = dyn Fn(&Document, usize, usize) + Send + Sync;
type RemovedFn = dyn Fn(&Document, usize) + Send + Sync;
type ErrorFn = dyn Fn(&LiveError) + Send + Sync;

/// Callbacks a live query delivers changes to.
///
/// Every callback is optional. Indices refer to the results as they stand
/// after every earlier callback of the same poll, so replaying callbacks in
/// order against a copy of the results keeps that copy identical to the
/// query's snapshot. [`LiveQuery::snapshot`] called from a callback already
/// returns the poll's final results.
///
/// # Example
///
/// ```rust,ignore
/// let callbacks = ObserveCallbacks::new()
///     .added(|doc, before| println!("added {:?} at {before}", doc.id()))
///     .removed(|doc, at| println!("removed {:?} from {at}", doc.id()));
/// ```
#[derive(Default)]
pub struct ObserveCallbacks {
    added: Option<Box<AddedFn>>,
    changed: Option<Box<ChangedFn>>,
    moved: Option<Box<MovedFn>>,
    removed: Option<Box<RemovedFn>>,
    error: Option<Box<ErrorFn>>,
}

impl ObserveCallbacks {
    /// Creates an empty callback set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `added(doc, before_index)`: a document entered the results.
    #[must_use]
    pub fn added<F>(mut self, f: F) -> Self
    where
        F: Fn(&Document, usize) + Send + Sync + 'static,
    {
        self.added = Some(Box::new(f));
        self
    }

    /// `changed(new_doc, at_index, old_doc)`: a document's contents changed.
    #[must_use]
    pub fn changed<F>(mut self, f: F) -> Self
    where
        F: Fn(&Document, usize, &Document) + Send + Sync + 'static,
    {
        self.changed = Some(Box::new(f));
        self
    }

    /// `moved(doc, from_index, to_index)`: a document changed position.
    #[must_use]
    pub fn moved<F>(mut self, f: F) -> Self
    where
        F: Fn(&Document, usize, usize) + Send + Sync + 'static,
    {
        self.moved = Some(Box::new(f));
        self
    }

    /// `removed(old_doc, at_index)`: a document left the results.
    #[must_use]
    pub fn removed<F>(mut self, f: F) -> Self
    where
        F: Fn(&Document, usize) + Send + Sync + 'static,
    {
        self.removed = Some(Box::new(f));
        self
    }

    /// Called when a poll fails. The query keeps its previous snapshot.
    #[must_use]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&LiveError) + Send + Sync + 'static,
    {
        self.error = Some(Box::new(f));
        self
    }

    fn deliver(&self, change: &Change) {
        match change {
            Change::Added { doc, before } => {
                if let Some(f) = &self.added {
                    f(doc, *before);
                }
            }
            Change::Changed { doc, at, old } => {
                if let Some(f) = &self.changed {
                    f(doc, *at, old);
                }
            }
            Change::Moved { doc, from, to } => {
                if let Some(f) = &self.moved {
                    f(doc, *from, *to);
                }
            }
            Change::Removed { doc, at } => {
                if let Some(f) = &self.removed {
                    f(doc, *at);
                }
            }
        }
    }

    fn fail(&self, err: &LiveError) {
        if let Some(f) = &self.error {
            f(err);
        }
    }
}

impl fmt::Debug for ObserveCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveCallbacks")
            .field("added", &self.added.is_some())
            .field("changed", &self.changed.is_some())
            .field("moved", &self.moved.is_some())
            .field("removed", &self.removed.is_some())
            .field("on_error", &self.error.is_some())
            .finish()
    }
}

/// Lifecycle of a live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveQueryState {
    /// Waiting for an invalidation or the refresh timer.
    Idle,
    /// A poll is in progress.
    Polling,
    /// Stopped; no further callbacks will be scheduled.
    Stopped,
}

/// Counters describing a live query's polling history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveQueryStats {
    /// Completed polls, including the initial one.
    pub polls: u64,
    /// Polls abandoned because the store or the diff failed.
    pub failed_polls: u64,
    /// Polls whose diff had to fall back to moving every document.
    pub slow_mode_polls: u64,
    /// Error from the most recent failed poll.
    pub last_error: Option<LiveError>,
}

#[derive(Default)]
struct PollState {
    dirty: bool,
    poll_running: bool,
    scheduled: bool,
    stopped: bool,
    /// Failed polls since the last success or release.
    failure_streak: u32,
    /// Fence writes waiting for the next poll to start and finish.
    pending_writes: Vec<WriteToken>,
}

struct Engine {
    id: u64,
    conn: Connection,
    description: CursorDescription,
    callbacks: ObserveCallbacks,
    state: Mutex<PollState>,
    results: Mutex<Vec<Document>>,
    stats: Mutex<LiveQueryStats>,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
    listeners: Mutex<Vec<ListenerHandle>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Handles an invalidation for one of our keys.
    fn invalidated(&self) {
        if let Some(fence) = WriteFence::current() {
            let write = fence.begin_write();
            let mut state = self.state.lock();
            if !state.stopped {
                state.pending_writes.push(write);
            }
        }
        self.mark_dirty();
    }

    fn mark_dirty(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        state.dirty = true;
        if state.poll_running || state.scheduled {
            return;
        }
        state.scheduled = true;
        drop(state);
        self.wake.notify_one();
    }

    /// Runs a poll the poller task picked up.
    async fn run_scheduled_poll(&self) {
        let writes = {
            let mut state = self.state.lock();
            state.scheduled = false;
            if state.stopped {
                return;
            }
            state.poll_running = true;
            state.dirty = false;
            std::mem::take(&mut state.pending_writes)
        };

        // Failures are recorded and reported to `on_error`.
        let released = match self.poll().await {
            Ok(()) => {
                self.state.lock().failure_streak = 0;
                writes
            }
            Err(_) => self.hold_for_retry(writes),
        };
        drop(released);
        self.finish_poll();
    }

    /// Keeps a failed poll's fence writes for the next attempt.
    ///
    /// Returns the writes to release instead: all of them once the query is
    /// stopped or has failed more than `poll_failure_retries` times in a row.
    fn hold_for_retry(&self, mut writes: Vec<WriteToken>) -> Vec<WriteToken> {
        let limit = self.conn.config().poll_failure_retries;
        let mut state = self.state.lock();
        if state.stopped {
            return writes;
        }
        state.failure_streak += 1;
        if state.failure_streak > limit {
            warn!(
                query = self.id,
                failures = state.failure_streak,
                writes = writes.len(),
                "live query releasing fence writes after repeated poll failures"
            );
            state.failure_streak = 0;
            return writes;
        }
        writes.append(&mut state.pending_writes);
        state.pending_writes = writes;
        state.dirty = true;
        Vec::new()
    }

    fn finish_poll(&self) {
        let mut state = self.state.lock();
        state.poll_running = false;
        if state.stopped {
            return;
        }
        if state.dirty || !state.pending_writes.is_empty() {
            state.scheduled = true;
            drop(state);
            self.wake.notify_one();
        }
    }

    /// Fetches fresh results, diffs them against the snapshot and delivers
    /// the changes.
    async fn poll(&self) -> LiveResult<()> {
        let fresh = match self.conn.fetch(&self.description).await {
            Ok(docs) => docs,
            Err(err) => return Err(self.record_failure(err)),
        };

        let outcome = {
            let results = self.results.lock();
            diff_ordered(&results, &fresh)
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.record_failure(err.into())),
        };

        *self.results.lock() = fresh;
        for change in &outcome.changes {
            self.callbacks.deliver(change);
        }

        let mut stats = self.stats.lock();
        stats.polls += 1;
        if outcome.slow_mode {
            stats.slow_mode_polls += 1;
        }
        debug!(
            query = self.id,
            collection = %self.description.collection,
            changes = outcome.changes.len(),
            slow_mode = outcome.slow_mode,
            "live query polled"
        );
        Ok(())
    }

    fn record_failure(&self, err: LiveError) -> LiveError {
        error!(
            query = self.id,
            collection = %self.description.collection,
            error = %err,
            "live query poll failed"
        );
        {
            let mut stats = self.stats.lock();
            stats.failed_polls += 1;
            stats.last_error = Some(err.clone());
        }
        self.callbacks.fail(&err);
        err
    }

    fn stop(&self) {
        let writes = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.dirty = false;
            std::mem::take(&mut state.pending_writes)
        };
        // Nothing will poll for these any more.
        drop(writes);

        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener.stop();
        }
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
        self.shutdown.notify_one();
        debug!(query = self.id, "live query stopped");
    }

    fn state(&self) -> LiveQueryState {
        let state = self.state.lock();
        if state.stopped {
            LiveQueryState::Stopped
        } else if state.poll_running {
            LiveQueryState::Polling
        } else {
            LiveQueryState::Idle
        }
    }
}

/// Waits for scheduled polls and runs them after the throttle window.
async fn run_poller(engine: Weak<Engine>, wake: Arc<Notify>, shutdown: Arc<Notify>, throttle: Duration) {
    loop {
        tokio::select! {
            () = wake.notified() => {}
            () = shutdown.notified() => return,
        }
        tokio::select! {
            () = tokio::time::sleep(throttle) => {}
            () = shutdown.notified() => return,
        }
        let Some(engine) = engine.upgrade() else {
            return;
        };
        engine.run_scheduled_poll().await;
    }
}

fn spawn_refresh(engine: Weak<Engine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match engine.upgrade() {
                Some(engine) => engine.mark_dirty(),
                None => return,
            }
        }
    })
}

/// Handle to a running live query.
///
/// Dropping the handle stops the query.
pub struct LiveQuery {
    engine: Arc<Engine>,
}

impl LiveQuery {
    pub(crate) async fn start(
        conn: Connection,
        description: CursorDescription,
        callbacks: ObserveCallbacks,
    ) -> LiveResult<Self> {
        let config: Config = conn.config().clone();
        let id = conn.next_observer_id();
        let engine = Arc::new(Engine {
            id,
            conn,
            description,
            callbacks,
            state: Mutex::new(PollState {
                poll_running: true,
                ..PollState::default()
            }),
            results: Mutex::new(Vec::new()),
            stats: Mutex::new(LiveQueryStats::default()),
            wake: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            listeners: Mutex::new(Vec::new()),
            refresh_task: Mutex::new(None),
        });

        // Listen before the first fetch so no write slips between them.
        let crossbar = engine.conn.crossbar().clone();
        let listeners = engine
            .description
            .keys
            .iter()
            .map(|key| {
                let weak = Arc::downgrade(&engine);
                crossbar.listen(key.clone(), move |_, done| {
                    if let Some(engine) = weak.upgrade() {
                        engine.invalidated();
                    }
                    done.complete();
                })
            })
            .collect();
        *engine.listeners.lock() = listeners;

        if let Err(err) = engine.poll().await {
            engine.stop();
            return Err(err);
        }

        tokio::spawn(run_poller(
            Arc::downgrade(&engine),
            Arc::clone(&engine.wake),
            Arc::clone(&engine.shutdown),
            config.poll_throttle,
        ));
        if !config.refresh_interval.is_zero() {
            let task = spawn_refresh(Arc::downgrade(&engine), config.refresh_interval);
            *engine.refresh_task.lock() = Some(task);
        }
        engine.finish_poll();

        debug!(
            query = id,
            collection = %engine.description.collection,
            keys = engine.description.keys.len(),
            "live query started"
        );
        Ok(Self { engine })
    }

    /// Returns this query's observer id, unique per connection.
    pub fn id(&self) -> u64 {
        self.engine.id
    }

    /// Returns a copy of the current snapshot.
    pub fn snapshot(&self) -> Vec<Document> {
        self.engine.results.lock().clone()
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> LiveQueryState {
        self.engine.state()
    }

    /// Returns the polling counters.
    pub fn stats(&self) -> LiveQueryStats {
        self.engine.stats.lock().clone()
    }

    /// Forces a re-poll, as if an invalidation had arrived.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Stopped`] once the query is stopped.
    pub fn mark_dirty(&self) -> LiveResult<()> {
        if self.engine.state() == LiveQueryState::Stopped {
            return Err(LiveError::Stopped { id: self.engine.id });
        }
        self.engine.mark_dirty();
        Ok(())
    }

    /// Stops the query.
    ///
    /// Idempotent. A poll already in flight runs to completion, but no
    /// further polls are scheduled and pending fence writes are released.
    pub fn stop(&self) {
        self.engine.stop();
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.engine.stop();
    }
}

impl fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("id", &self.engine.id)
            .field("collection", &self.engine.description.collection)
            .field("state", &self.engine.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossbar::InvalidationKey;
    use livedata_store::{
        DataStore, FindOptions, MemoryStore, Modifier, SortOrder, UpdateOptions,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick() -> Config {
        Config::new().poll_throttle(Duration::from_millis(5))
    }

    fn connection() -> Connection {
        Connection::open(
            Arc::new(MemoryStore::new()),
            crate::InvalidationCrossbar::new(),
            quick(),
        )
    }

    fn doc(value: serde_json::Value) -> Document {
        Document::try_from(value).unwrap()
    }

    #[tokio::test]
    async fn initial_results_are_added() {
        let conn = connection();
        conn.insert("items", doc(json!({"_id": "a", "x": 1}))).await.unwrap();
        conn.insert("items", doc(json!({"_id": "b", "x": 2}))).await.unwrap();

        let added = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&added);
        let query = conn
            .find("items", json!({}), FindOptions::new().sort_by("x", SortOrder::Ascending))
            .unwrap()
            .observe(ObserveCallbacks::new().added(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        assert_eq!(added.load(Ordering::SeqCst), 2);
        assert_eq!(query.snapshot().len(), 2);
        assert_eq!(query.stats().polls, 1);
        assert_eq!(query.state(), LiveQueryState::Idle);
    }

    #[tokio::test]
    async fn fenced_write_is_visible_after_wait() {
        let conn = connection();
        let query = conn
            .find("items", json!({}), FindOptions::default())
            .unwrap()
            .observe(ObserveCallbacks::new())
            .await
            .unwrap();

        let fence = WriteFence::new();
        fence
            .run(conn.insert("items", doc(json!({"_id": "a"}))))
            .await
            .unwrap();
        assert_eq!(query.snapshot().len(), 1);

        let fence = WriteFence::new();
        fence
            .run(conn.update(
                "items",
                json!("a"),
                Modifier::set("y", json!(2)),
                UpdateOptions::new(),
            ))
            .await
            .unwrap();
        assert_eq!(query.snapshot()[0].get("y"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_listeners() {
        let conn = connection();
        let query = conn
            .find("items", json!({}), FindOptions::default())
            .unwrap()
            .observe(ObserveCallbacks::new())
            .await
            .unwrap();
        let key = InvalidationKey::collection("items");
        assert_eq!(conn.crossbar().listener_count(&key), 1);

        query.stop();
        query.stop();
        assert_eq!(query.state(), LiveQueryState::Stopped);
        assert_eq!(conn.crossbar().listener_count(&key), 0);
        assert!(matches!(query.mark_dirty(), Err(LiveError::Stopped { .. })));

        // Writes no longer wait on the stopped query.
        let fence = WriteFence::new();
        fence
            .run(conn.insert("items", doc(json!({"_id": "a"}))))
            .await
            .unwrap();
        assert!(query.snapshot().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_query() {
        let conn = connection();
        let key = InvalidationKey::collection("items");
        {
            let _query = conn
                .find("items", json!({}), FindOptions::default())
                .unwrap()
                .observe(ObserveCallbacks::new())
                .await
                .unwrap();
            assert_eq!(conn.crossbar().listener_count(&key), 1);
        }
        assert_eq!(conn.crossbar().listener_count(&key), 0);
    }

    #[tokio::test]
    async fn refresh_timer_catches_unannounced_writes() {
        let store = Arc::new(MemoryStore::new());
        let conn = Connection::open(
            store.clone(),
            crate::InvalidationCrossbar::new(),
            quick().refresh_interval(Duration::from_millis(20)),
        );
        let query = conn
            .find("items", json!({}), FindOptions::default())
            .unwrap()
            .observe(ObserveCallbacks::new())
            .await
            .unwrap();

        // Straight to the store: no invalidation is fired.
        store.insert("items", doc(json!({"_id": "a"}))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(query.snapshot().len(), 1);
        assert!(query.stats().polls >= 2);
    }

    #[tokio::test]
    async fn burst_of_writes_coalesces() {
        let conn = Connection::open(
            Arc::new(MemoryStore::new()),
            crate::InvalidationCrossbar::new(),
            Config::new().poll_throttle(Duration::from_millis(30)),
        );
        let query = conn
            .find("items", json!({}), FindOptions::default())
            .unwrap()
            .observe(ObserveCallbacks::new())
            .await
            .unwrap();

        let fence = WriteFence::new();
        fence
            .run(async {
                for i in 0..10 {
                    conn.insert("items", doc(json!({ "i": i }))).await.unwrap();
                }
            })
            .await;
        assert_eq!(query.snapshot().len(), 10);
        // The initial poll plus far fewer than one per write.
        assert!(query.stats().polls <= 3, "{:?}", query.stats());
    }
}
