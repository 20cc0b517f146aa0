//! Fuzz command implementation.

use livedata_core::Config;
use livedata_store::MemoryStore;
use livedata_testkit::{fuzz_observe, FuzzConfig, FuzzReport, TestConnection};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

/// Fuzz run summary.
#[derive(Debug, Serialize)]
pub struct FuzzSummary {
    /// Seed used; pass it back with `--seed` to replay the run.
    pub seed: u64,
    /// Batches executed.
    pub steps: usize,
    /// Writes executed.
    pub operations: usize,
    /// `added` callbacks.
    pub added: u64,
    /// `changed` callbacks.
    pub changed: u64,
    /// `moved` callbacks.
    pub moved: u64,
    /// `removed` callbacks.
    pub removed: u64,
    /// Documents left in the results.
    pub final_len: usize,
}

impl FuzzSummary {
    fn new(seed: u64, report: &FuzzReport) -> Self {
        Self {
            seed,
            steps: report.steps,
            operations: report.operations,
            added: report.counters.added,
            changed: report.counters.changed,
            moved: report.counters.moved,
            removed: report.counters.removed,
            final_len: report.final_len,
        }
    }
}

/// Runs the fuzz command.
pub async fn run(
    throttle: Duration,
    steps: usize,
    max_batch: usize,
    seed: Option<u64>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let seed = seed.unwrap_or_else(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_nanos() as u64)
    });
    let config = FuzzConfig {
        steps,
        max_batch,
        seed,
    };
    let conn = TestConnection::with_store(MemoryStore::new(), Config::new().poll_throttle(throttle));

    info!(seed, steps, max_batch, "running live query fuzz");
    let report = match fuzz_observe(&conn, &config).await {
        Ok(report) => report,
        Err(failure) => {
            error!(seed, %failure, "fuzz run failed");
            return Err(format!("fuzz failed (seed {seed}): {failure}").into());
        }
    };

    let summary = FuzzSummary::new(seed, &report);
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        _ => {
            println!("Fuzz run passed");
            println!("===============");
            println!("Seed:       {}", summary.seed);
            println!("Steps:      {}", summary.steps);
            println!("Operations: {}", summary.operations);
            println!(
                "Callbacks:  {} added, {} changed, {} moved, {} removed",
                summary.added, summary.changed, summary.moved, summary.removed
            );
            println!("Final size: {}", summary.final_len);
        }
    }
    Ok(())
}
