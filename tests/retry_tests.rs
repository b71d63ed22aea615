
use std::sync::atomic::{AtomicU32, Ordering};

use ddc::api::RuntimePhase;
use ddc::cluster::{ClusterBackend, ClusterError};
use ddc::retry::{UpdateOutcome, retry_on_conflict, update_with_retry};

use test_helpers::*;

#[ddc::test]
async fn status_update_survives_conflicts() {
    let cluster = MockCluster::new();
    cluster.insert_runtime(runtime("hbase", 1));
    cluster.inject_conflicts(3);

    let outcome = update_with_retry(
        &fast_retry(),
        || cluster.get_runtime(NS, "hbase"),
        |rt| rt.status.master_phase = RuntimePhase::NotReady,
        |rt| cluster.update_runtime_status(rt),
    )
    .await
    .unwrap();

    assert!(outcome.is_updated());
    assert_eq!(
        cluster.runtime(NS, "hbase").status.master_phase,
        RuntimePhase::NotReady
    );
    assert_eq!(cluster.status_writes.load(Ordering::SeqCst), 1);
}

#[ddc::test]
async fn exhausted_budget_returns_conflict() {
    let cluster = MockCluster::new();
    cluster.insert_runtime(runtime("hbase", 1));
    cluster.inject_conflicts(100);

    let err = update_with_retry(
        &fast_retry(),
        || cluster.get_runtime(NS, "hbase"),
        |rt| rt.status.master_phase = RuntimePhase::Ready,
        |rt| cluster.update_runtime_status(rt),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ClusterError::Conflict { .. }), "got {err}");
    assert_eq!(
        cluster.runtime(NS, "hbase").status.master_phase,
        RuntimePhase::None
    );
}

#[ddc::test]
async fn unchanged_object_is_not_written() {
    let cluster = MockCluster::new();
    cluster.insert_runtime(runtime("hbase", 1));

    let outcome = update_with_retry(
        &fast_retry(),
        || cluster.get_runtime(NS, "hbase"),
        |rt| rt.status.master_phase = RuntimePhase::None,
        |rt| cluster.update_runtime_status(rt),
    )
    .await
    .unwrap();

    assert!(matches!(outcome, UpdateOutcome::Unchanged(_)));
    assert_eq!(cluster.status_writes.load(Ordering::SeqCst), 0);
}

#[ddc::test]
async fn mutation_sees_the_latest_object() {
    let cluster = MockCluster::new();
    cluster.insert_runtime(runtime("hbase", 1));
    cluster.inject_conflicts(1);
    let seen = AtomicU32::new(0);

    update_with_retry(
        &fast_retry(),
        || cluster.get_runtime(NS, "hbase"),
        |rt| {
            seen.fetch_add(1, Ordering::SeqCst);
            rt.status.worker_number_ready += 1;
        },
        |rt| cluster.update_runtime_status(rt),
    )
    .await
    .unwrap();

    // Two attempts, but the increment is applied to fresh state each time.
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(cluster.runtime(NS, "hbase").status.worker_number_ready, 1);
}

#[ddc::test]
async fn other_errors_are_not_retried() {
    let cluster = MockCluster::new();
    let calls = AtomicU32::new(0);

    let err = retry_on_conflict(&fast_retry(), || {
        calls.fetch_add(1, Ordering::SeqCst);
        cluster.get_runtime(NS, "missing")
    })
    .await
    .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
