//! End-to-end workloads for [`SerialMap`] exercised through the public API only.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::future::join_all;
use tandem_map::SerialMap;
use tandem_sync::CountDownLatch;
use thiserror::Error;
use tokio::time::{sleep, timeout};

const BOUND: Duration = Duration::from_secs(5);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("computation failed")]
struct ComputeFailed;

#[tokio::test]
async fn test_expensive_computation_runs_once() {
    const CALLERS: u32 = 20;

    let map = SerialMap::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(CountDownLatch::new(1));

    let mut callers = Vec::new();
    for _ in 0..CALLERS {
        let fut = map.compute_if_absent("config", {
            let invocations = invocations.clone();
            move |_key: &&str| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async move {
                    sleep(Duration::from_millis(10)).await;
                    Ok::<_, ComputeFailed>(Some("loaded".to_string()))
                }
            }
        });
        let start = start.clone();
        callers.push(tokio::spawn(async move {
            start.wait().await;
            fut.await
        }));
    }

    start.count_down();
    for joined in timeout(BOUND, join_all(callers)).await.unwrap() {
        assert_eq!(joined.unwrap(), Ok(Some("loaded".to_string())));
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(map.get(&"config"), Some("loaded".to_string()));
}

#[tokio::test]
async fn test_per_key_counters_are_exact_under_contention() {
    const KEYS: i32 = 5;
    const INCREMENTS: i32 = 10;

    let map = SerialMap::new();
    let mut updates = Vec::new();
    for _ in 0..INCREMENTS {
        for key in 0..KEYS {
            let fut = map.compute(key, |_key: &i32, old| async move { Ok::<_, ComputeFailed>(Some(old.unwrap_or(0) + 1)) });
            updates.push(tokio::spawn(fut));
        }
    }

    for joined in timeout(BOUND, join_all(updates)).await.unwrap() {
        joined.unwrap().unwrap();
    }
    assert_eq!(map.len(), KEYS as usize);
    for key in 0..KEYS {
        assert_eq!(map.get(&key), Some(INCREMENTS));
    }
}

#[tokio::test]
async fn test_merge_aggregates_contributions() {
    const CONTRIBUTORS: i64 = 10;

    let map = SerialMap::new();
    let mut contributions = Vec::new();
    for _ in 0..CONTRIBUTORS {
        let fut = map.merge("total", 1i64, |old, new| async move { Ok::<_, ComputeFailed>(Some(old + new)) });
        contributions.push(tokio::spawn(fut));
    }

    for joined in timeout(BOUND, join_all(contributions)).await.unwrap() {
        joined.unwrap().unwrap();
    }
    assert_eq!(map.get(&"total"), Some(CONTRIBUTORS));
}

#[tokio::test]
async fn test_reload_pattern_clear_then_repopulate() {
    let map = SerialMap::new();
    for k in 0..10 {
        map.insert(k, format!("v{}", k)).await;
    }
    assert_eq!(map.len(), 10);

    timeout(BOUND, map.clear()).await.unwrap();
    assert!(map.is_empty());

    for k in 0..3 {
        map.insert(k, format!("fresh{}", k)).await;
    }
    assert_eq!(map.len(), 3);
    assert_eq!(map.get(&0), Some("fresh0".to_string()));
    assert_eq!(map.keys(), vec![0, 1, 2]);
}
