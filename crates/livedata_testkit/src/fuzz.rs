//! Randomized convergence harness for live queries.
//!
//! [`fuzz_observe`] drives random batches of writes through a connection
//! while a live query sorted by `x` watches them. After every batch it
//! checks that:
//! - replaying the callbacks reproduces the expected sorted values
//! - no callback kind fired more often than the batch could justify
//!   (at most one `moved` per changed document)

use crate::fixtures::{CallbackCounters, ReplayArray};
use livedata_core::{Connection, LiveError, LiveResult, WriteFence};
use livedata_store::{
    new_document_id, Document, FindOptions, Modifier, SortOrder, UpdateOptions,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use thiserror::Error;

/// Collection the fuzz harness writes to.
pub const FUZZ_COLLECTION: &str = "livedata_fuzz_collection";

const VALUE_RANGE: i64 = 1_000_000;

/// Fuzz run parameters.
#[derive(Debug, Clone)]
pub struct FuzzConfig {
    /// Number of batches.
    pub steps: usize,
    /// Largest batch size; each batch has between 1 and this many writes.
    pub max_batch: usize,
    /// RNG seed; the same seed replays the same writes.
    pub seed: u64,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            steps: 100,
            max_batch: 5,
            seed: 0x5eed,
        }
    }
}

/// One generated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzOp {
    /// Insert a document with this `x`.
    Insert {
        /// Value inserted.
        x: i64,
    },
    /// Change `x` by one; rarely reorders.
    Nudge {
        /// Current value.
        from: i64,
        /// New value.
        to: i64,
    },
    /// Change `x` to a random value; usually reorders.
    Rewrite {
        /// Current value.
        from: i64,
        /// New value.
        to: i64,
    },
    /// Remove the document with this `x`.
    Remove {
        /// Value removed.
        x: i64,
    },
}

/// Summary of a successful run.
#[derive(Debug, Clone, Default)]
pub struct FuzzReport {
    /// Batches executed.
    pub steps: usize,
    /// Writes executed.
    pub operations: usize,
    /// Callbacks delivered.
    pub counters: CallbackCounters,
    /// Documents left in the results.
    pub final_len: usize,
}

/// Why a fuzz run failed.
#[derive(Debug, Error)]
pub enum FuzzFailure {
    /// A write or the live query itself failed.
    #[error("step {step}: {source}")]
    Live {
        /// Batch index.
        step: usize,
        /// Underlying error.
        source: LiveError,
    },

    /// A callback named a document that was not where it said.
    #[error("step {step}: inconsistent callback: {message}")]
    Inconsistent {
        /// Batch index.
        step: usize,
        /// First recorded inconsistency.
        message: String,
    },

    /// Replaying the callbacks did not reproduce the expected results.
    #[error("step {step}: replayed {actual:?}, expected {expected:?}")]
    Diverged {
        /// Batch index.
        step: usize,
        /// Values rebuilt from callbacks.
        actual: Vec<i64>,
        /// Values the store holds.
        expected: Vec<i64>,
    },

    /// More callbacks than the batch's writes could justify.
    #[error("step {step}: callbacks {actual:?} exceed {max:?}")]
    TooManyCallbacks {
        /// Batch index.
        step: usize,
        /// Counters after the batch.
        actual: CallbackCounters,
        /// Upper bound for the batch.
        max: CallbackCounters,
    },
}

/// Picks a value not already in `taken`, preferring `preferred`.
fn fresh_value(rng: &mut StdRng, taken: &[i64], preferred: &[i64]) -> i64 {
    if let Some(x) = preferred.iter().copied().find(|x| !taken.contains(x)) {
        return x;
    }
    loop {
        let x = rng.gen_range(0..VALUE_RANGE);
        if !taken.contains(&x) {
            return x;
        }
    }
}

/// Generates one batch, updating `expected` and the callback bound `max`.
///
/// Values stay unique so that selecting on `x` names exactly one document.
pub fn plan_batch(
    rng: &mut StdRng,
    expected: &mut Vec<i64>,
    max: &mut CallbackCounters,
    inserts_only: bool,
    max_batch: usize,
) -> Vec<FuzzOp> {
    let count = rng.gen_range(1..=max_batch.max(1));
    let mut ops = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = rng.gen_range(0..4);
        if kind == 0 || inserts_only || expected.is_empty() {
            let x = fresh_value(rng, expected, &[]);
            expected.push(x);
            max.added += 1;
            ops.push(FuzzOp::Insert { x });
            continue;
        }

        let which = rng.gen_range(0..expected.len());
        let from = expected[which];
        match kind {
            1 => {
                let step = if rng.gen_bool(0.5) { -1 } else { 1 };
                let to = fresh_value(rng, expected, &[from + step, from - step]);
                expected[which] = to;
                max.changed += 1;
                max.moved += 1;
                ops.push(FuzzOp::Nudge { from, to });
            }
            2 => {
                let to = fresh_value(rng, expected, &[]);
                expected[which] = to;
                max.changed += 1;
                max.moved += 1;
                ops.push(FuzzOp::Rewrite { from, to });
            }
            _ => {
                expected.remove(which);
                max.removed += 1;
                ops.push(FuzzOp::Remove { x: from });
            }
        }
    }
    ops
}

async fn apply_batch(conn: &Connection, run: &str, ops: &[FuzzOp]) -> LiveResult<()> {
    for op in ops {
        match *op {
            FuzzOp::Insert { x } => {
                let doc = Document::try_from(json!({"run": run, "x": x}))?;
                conn.insert(FUZZ_COLLECTION, doc).await?;
            }
            FuzzOp::Nudge { from, to } | FuzzOp::Rewrite { from, to } => {
                conn.update(
                    FUZZ_COLLECTION,
                    json!({"run": run, "x": from}),
                    Modifier::set("x", json!(to)),
                    UpdateOptions::new(),
                )
                .await?;
            }
            FuzzOp::Remove { x } => {
                conn.remove(FUZZ_COLLECTION, json!({"run": run, "x": x}))
                    .await?;
            }
        }
    }
    Ok(())
}

/// Runs the convergence fuzz against `conn`.
///
/// Each batch runs inside its own write fence, so the live query has
/// delivered every callback by the time the batch is checked.
pub async fn fuzz_observe(conn: &Connection, config: &FuzzConfig) -> Result<FuzzReport, FuzzFailure> {
    let run = new_document_id();
    let replay = ReplayArray::new();
    let mut rng = StdRng::seed_from_u64(config.seed);

    let live = |step| move |source| FuzzFailure::Live { step, source };
    let query = conn
        .find(
            FUZZ_COLLECTION,
            json!({ "run": run }),
            FindOptions::new().sort_by("x", SortOrder::Ascending),
        )
        .map_err(live(0))?
        .observe(replay.callbacks())
        .await
        .map_err(live(0))?;

    let mut expected = Vec::new();
    let mut operations = 0;
    for step in 0..config.steps {
        let mut max = replay.counters();
        let ops = plan_batch(&mut rng, &mut expected, &mut max, step == 0, config.max_batch);
        operations += ops.len();

        WriteFence::new()
            .run(apply_batch(conn, &run, &ops))
            .await
            .map_err(live(step))?;

        if let Some(message) = replay.violations().into_iter().next() {
            return Err(FuzzFailure::Inconsistent { step, message });
        }

        expected.sort_unstable();
        let actual: Vec<i64> = replay
            .values("x")
            .iter()
            .filter_map(Value::as_i64)
            .collect();
        if actual != expected {
            return Err(FuzzFailure::Diverged {
                step,
                actual,
                expected: expected.clone(),
            });
        }

        let counters = replay.counters();
        if !counters.within(&max) {
            return Err(FuzzFailure::TooManyCallbacks {
                step,
                actual: counters,
                max,
            });
        }
    }

    query.stop();
    Ok(FuzzReport {
        steps: config.steps,
        operations,
        counters: replay.counters(),
        final_len: expected.len(),
    })
}
