//! Connection behavior: failure injection, deferred connect, selector guard.

use livedata_core::{
    rewrite_selector, Config, Connection, InvalidationCrossbar, InvalidationKey, LiveError,
    ObserveCallbacks, FAILURE_TEST_COLLECTION,
};
use livedata_store::{DataStore, FindOptions, MemoryStore, Modifier, StoreError, UpdateOptions};
use livedata_testkit::prelude::*;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn failure_collection_rejects_every_write_kind() {
    let conn = TestConnection::memory();

    let insert = conn
        .insert(FAILURE_TEST_COLLECTION, doc(json!({"fail": true})))
        .await;
    let update = conn
        .update(
            FAILURE_TEST_COLLECTION,
            json!({"fail": true}),
            Modifier::set("x", json!(1)),
            UpdateOptions::new(),
        )
        .await;
    let remove = conn
        .remove(FAILURE_TEST_COLLECTION, json!({"fail": true}))
        .await;

    assert!(insert.unwrap_err().is_injected());
    assert!(update.unwrap_err().is_injected());
    assert!(remove.unwrap_err().is_injected());
    assert!(conn.store.is_empty(FAILURE_TEST_COLLECTION));
}

#[tokio::test]
async fn injected_failure_inside_fence_does_not_hang() {
    let conn = TestConnection::memory();
    let _query = conn
        .find(FAILURE_TEST_COLLECTION, json!({}), FindOptions::default())
        .unwrap()
        .observe(ObserveCallbacks::new())
        .await
        .unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        fenced(conn.insert(FAILURE_TEST_COLLECTION, doc(json!({"fail": 1})))),
    )
    .await
    .expect("fence must fire");
    assert!(matches!(
        result,
        Err(LiveError::Store(StoreError::InjectedFailure { .. }))
    ));
}

#[tokio::test]
async fn deferred_connection_observes_queued_writes() {
    let (ready, wait) = tokio::sync::oneshot::channel::<()>();
    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn DataStore> = store.clone();
    let conn = Connection::connect(
        async move {
            let _ = wait.await;
            Ok(shared)
        },
        InvalidationCrossbar::new(),
        quick_config(),
    );

    let writer = {
        let conn = conn.clone();
        tokio::spawn(async move {
            for x in 0..3 {
                conn.insert(TEST_COLLECTION, doc(json!({ "x": x })))
                    .await
                    .unwrap();
            }
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(store.is_empty(TEST_COLLECTION));

    ready.send(()).unwrap();
    writer.await.unwrap();
    assert_eq!(store.len(TEST_COLLECTION), 3);

    let mut cursor = conn
        .find(TEST_COLLECTION, json!({}), FindOptions::default())
        .unwrap();
    let xs = cursor
        .map(|d| d.get("x").cloned().unwrap())
        .await
        .unwrap();
    assert_eq!(xs, vec![json!(0), json!(1), json!(2)]);
}

#[tokio::test]
async fn connections_sharing_a_crossbar_see_each_other() {
    let store = Arc::new(MemoryStore::new());
    let crossbar = InvalidationCrossbar::new();
    let config = Config::new().poll_throttle(Duration::from_millis(5));
    let reader = Connection::open(store.clone(), crossbar.clone(), config.clone());
    let writer = Connection::open(store, crossbar.clone(), config);

    let log = CallbackLog::new("x");
    let _query = reader
        .find(TEST_COLLECTION, json!({}), FindOptions::default())
        .unwrap()
        .observe(log.callbacks())
        .await
        .unwrap();
    assert_eq!(
        crossbar.listener_count(&InvalidationKey::collection(TEST_COLLECTION)),
        1
    );

    fenced(writer.insert(TEST_COLLECTION, doc(json!({"x": 5}))))
        .await
        .unwrap();
    assert_eq!(log.take(), "a(5,0)");
}

proptest! {
    #[test]
    fn falsy_selectors_match_nothing(raw in falsy_selector_strategy()) {
        let selector = rewrite_selector(raw).unwrap();
        let id = selector.get("_id").and_then(|v| v.as_str()).unwrap().to_string();
        prop_assert_eq!(id.len(), 36);
        prop_assert_eq!(selector.conditions().len(), 1);
    }
}
