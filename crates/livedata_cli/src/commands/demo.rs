//! Demo command implementation.

use livedata_core::Config;
use livedata_store::MemoryStore;
use livedata_testkit::scenarios::{self, ScenarioStep};
use livedata_testkit::TestConnection;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

/// Outcome of one walkthrough step.
#[derive(Debug, Serialize)]
pub struct DemoStep {
    /// What the step does.
    pub name: &'static str,
    /// Callbacks delivered.
    pub log: String,
    /// Acceptable callback logs.
    pub expected: Vec<&'static str>,
    /// Whether `log` is one of `expected`.
    pub ok: bool,
}

impl From<ScenarioStep> for DemoStep {
    fn from(step: ScenarioStep) -> Self {
        let ok = step.matches();
        Self {
            name: step.name,
            log: step.log,
            expected: step.expected.to_vec(),
            ok,
        }
    }
}

/// Runs the demo command.
pub async fn run(
    throttle: Duration,
    unstable: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = if unstable {
        MemoryStore::with_unstable_order()
    } else {
        MemoryStore::new()
    };
    let conn = TestConnection::with_store(store, Config::new().poll_throttle(throttle));

    info!(unstable, "running observe walkthrough");
    let steps: Vec<DemoStep> = scenarios::basics(&conn)
        .await?
        .into_iter()
        .map(DemoStep::from)
        .collect();
    let failed = steps.iter().filter(|step| !step.ok).count();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&steps)?);
        }
        _ => {
            print_text_output(&steps);
        }
    }

    if failed > 0 {
        return Err(format!("{failed} step(s) produced unexpected callbacks").into());
    }
    Ok(())
}

fn print_text_output(steps: &[DemoStep]) {
    println!("Observe walkthrough");
    println!("===================");
    for step in steps {
        let status = if step.ok { "ok" } else { "MISMATCH" };
        println!("{:<28} {:<24} {}", step.name, step.log, status);
        if !step.ok {
            println!("{:<28} expected one of {:?}", "", step.expected);
        }
    }
}
