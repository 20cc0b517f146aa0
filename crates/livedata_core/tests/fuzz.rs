//! Randomized convergence of live queries under mixed write batches.

use livedata_testkit::prelude::*;

#[tokio::test]
async fn observe_converges_under_random_batches() {
    let conn = TestConnection::memory();
    for seed in [1, 2, 3] {
        let config = FuzzConfig {
            seed,
            ..FuzzConfig::default()
        };
        let report = fuzz_observe(&conn, &config)
            .await
            .unwrap_or_else(|failure| panic!("seed {seed}: {failure}"));
        assert_eq!(report.steps, 100);
        assert!(report.counters.moved <= report.counters.changed);
    }
}

#[tokio::test]
async fn fuzz_with_single_write_batches() {
    let conn = TestConnection::memory();
    let config = FuzzConfig {
        steps: 50,
        max_batch: 1,
        seed: 42,
    };
    let report = fuzz_observe(&conn, &config).await.unwrap();
    assert_eq!(report.operations, 50);
}
