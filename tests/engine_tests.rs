
use std::sync::atomic::Ordering;

use ddc::api::{DatasetPhase, PlacementMode, RuntimePhase};
use ddc::engine::{EngineError, EngineProfile, RuntimeEngine, finalizer_name};
use ddc::labels::{DATASET_NUM, EXCLUSIVE};
use ddc::port_parser::parse_ports_from_values;

use test_helpers::*;

const COMMON: &str = "fluid.io/s-fluid-hbase";
const RUNTIME_LABEL: &str = "fluid.io/s-alluxio-fluid-hbase";
const MEM_LABEL: &str = "fluid.io/s-h-alluxio-m-fluid-hbase";

const CAPACITY_REPORT: &str = "\
Capacity information for all workers:
    Total Capacity: 6.00GB
    Used Capacity: 900.00MB

Worker Name      Last Heartbeat   Storage       MEM
n1               0                capacity      2048.00MB
                                  used          500.00MB (24%)
n2               0                capacity      2048.00MB
                                  used          100.00MB (5%)
n3               0                capacity      2048.00MB
                                  used          300.00MB (15%)
";

fn summary(used: &str) -> String {
    format!(
        "Alluxio cluster summary:\n    Master Address: 10.0.0.1:19998\n    Total Capacity: 6.00GB\n        Tier: MEM  Size: 6.00GB\n    Used Capacity: {used}\n        Tier: MEM  Size: {used}\n"
    )
}

/// Seed a runtime with `replicas` workers, its dataset and `nodes`.
fn seed(h: &Harness, replicas: i32, nodes: &[&str]) {
    h.cluster.insert_runtime(runtime("hbase", replicas));
    h.cluster
        .insert_dataset(dataset("hbase", PlacementMode::Exclusive));
    h.add_nodes(nodes);
}

/// Run master and worker setup and mark the master ready.
async fn provision(h: &Harness, engine: &mut RuntimeEngine) {
    engine.setup_master().await.expect("setup master");
    h.cluster.set_statefulset_ready(NS, "hbase-master", 1);
    assert!(engine.check_master_ready().await.expect("master ready"));
    engine.setup_workers().await.expect("setup workers");
}

fn assigned(h: &Harness, node: &str) -> bool {
    h.cluster.node_labels(node).get(COMMON).map(String::as_str) == Some("true")
}

#[ddc::test]
async fn setup_master_installs_release_once() {
    let h = Harness::new();
    seed(&h, 1, &[]);
    let mut engine = h.engine("hbase");

    assert!(RuntimeEngine::should_setup_master(&h.cluster.runtime(NS, "hbase")));
    engine.setup_master().await.unwrap();
    assert_eq!(h.releases.installs.load(Ordering::SeqCst), 1);

    let rt = h.cluster.runtime(NS, "hbase");
    assert!(!RuntimeEngine::should_setup_master(&rt));
    assert_eq!(rt.status.master_phase, RuntimePhase::NotReady);
    assert_eq!(rt.status.value_file, "hbase-alluxio-values");

    // A second setup finds the master and only reconciles its replicas.
    engine.setup_master().await.unwrap();
    assert_eq!(h.releases.installs.load(Ordering::SeqCst), 1);
    assert_eq!(h.cluster.statefulset_replicas(NS, "hbase-master"), Some(1));
}

#[ddc::test]
async fn installed_values_record_reserved_ports() {
    let h = Harness::new();
    seed(&h, 1, &[]);
    let mut engine = h.engine("hbase");
    engine.setup_master().await.unwrap();

    let cm = h
        .cluster
        .configmap(NS, "hbase-alluxio-values")
        .expect("values configmap");
    let values = cm.data.unwrap().remove("data").unwrap();
    let ports = parse_ports_from_values(&values).unwrap();
    assert_eq!(ports, vec![20000, 20001]);
    assert!(ports.iter().all(|p| h.ctx.ports.is_reserved(*p)));
    assert_eq!(h.releases.last_values().as_deref(), Some(values.as_str()));
}

#[ddc::test]
async fn failed_install_gives_ports_back() {
    let h = Harness::new();
    seed(&h, 1, &[]);
    h.releases.fail_install.store(true, Ordering::SeqCst);
    let mut engine = h.engine("hbase");

    let err = engine.setup_master().await.unwrap_err();
    assert!(matches!(err, EngineError::Release(_)), "got {err}");
    assert_eq!(h.ctx.ports.reserved_count(), 0);
    assert!(h.cluster.configmap(NS, "hbase-alluxio-values").is_none());
    assert_eq!(
        h.cluster.runtime(NS, "hbase").status.master_phase,
        RuntimePhase::None
    );
}

#[ddc::test]
async fn master_phase_follows_ready_replicas() {
    let h = Harness::new();
    seed(&h, 1, &[]);
    let mut engine = h.engine("hbase");
    engine.setup_master().await.unwrap();

    assert!(!engine.check_master_ready().await.unwrap());
    assert_eq!(
        h.cluster.runtime(NS, "hbase").status.master_phase,
        RuntimePhase::NotReady
    );

    h.cluster.set_statefulset_ready(NS, "hbase-master", 1);
    assert!(engine.check_master_ready().await.unwrap());
    let rt = h.cluster.runtime(NS, "hbase");
    assert_eq!(rt.status.master_phase, RuntimePhase::Ready);
    assert_eq!(rt.status.master_number_ready, 1);
}

#[ddc::test]
async fn setup_workers_labels_nodes_and_scales() {
    let h = Harness::new();
    seed(&h, 2, &["n1", "n2", "n3"]);
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;

    let labels = h.cluster.node_labels("n1");
    assert_eq!(labels.get(COMMON).map(String::as_str), Some("true"));
    assert_eq!(labels.get(RUNTIME_LABEL).map(String::as_str), Some("true"));
    assert_eq!(labels.get(MEM_LABEL).map(String::as_str), Some("2GiB"));
    assert_eq!(labels.get(DATASET_NUM).map(String::as_str), Some("1"));
    assert_eq!(labels.get(EXCLUSIVE).map(String::as_str), Some("fluid_hbase"));
    assert!(assigned(&h, "n2"));
    assert!(!assigned(&h, "n3"));

    assert_eq!(h.cluster.statefulset_replicas(NS, "hbase-worker"), Some(2));
    let rt = h.cluster.runtime(NS, "hbase");
    assert!(!RuntimeEngine::should_setup_workers(&rt));
    assert_eq!(rt.status.worker_phase, RuntimePhase::NotReady);
    assert_eq!(rt.status.current_worker_number_scheduled, 2);
    assert_eq!(rt.status.desired_fuse_number_scheduled, 2);
}

#[ddc::test]
async fn exclusive_runtime_skips_shared_nodes() {
    let h = Harness::new();
    seed(&h, 2, &["n2"]);
    h.cluster.insert_node(node("n1", &[(DATASET_NUM, "1")]));
    let mut engine = h.engine("hbase");
    engine.setup_master().await.unwrap();

    let result = engine.setup_workers().await;
    assert!(result.is_ok(), "one node is enough to proceed: {result:?}");
    assert!(!assigned(&h, "n1"));
    assert!(assigned(&h, "n2"));
    assert_eq!(
        h.cluster.runtime(NS, "hbase").status.current_worker_number_scheduled,
        1
    );
}

#[ddc::test]
async fn no_eligible_node_is_reported() {
    let h = Harness::new();
    seed(&h, 1, &[]);
    h.cluster
        .insert_node(node("n1", &[(EXCLUSIVE, "other_dataset")]));
    let mut engine = h.engine("hbase");
    engine.setup_master().await.unwrap();

    let err = engine.setup_workers().await.unwrap_err();
    assert!(matches!(err, EngineError::NoSchedulableWorkers(_)), "got {err}");
}

#[ddc::test]
async fn legacy_profile_ignores_memory_quota() {
    let h = Harness::new();
    let mut rt = runtime("hbase", 1);
    rt.spec.tieredstore.levels[0].quota = Some("128Gi".to_string());
    h.cluster.insert_runtime(rt);
    h.cluster
        .insert_dataset(dataset("hbase", PlacementMode::Exclusive));
    h.add_nodes(&["n1"]);

    let mut hardened = h.engine("hbase");
    hardened.setup_master().await.unwrap();
    assert!(hardened.setup_workers().await.is_err());
    assert!(!assigned(&h, "n1"));

    let mut legacy = h.engine_with("hbase", EngineProfile::legacy());
    legacy.setup_workers().await.unwrap();
    assert!(assigned(&h, "n1"));
}

#[ddc::test]
async fn sync_replicas_scales_out_from_status_count() {
    let h = Harness::new();
    seed(&h, 2, &["n1", "n2", "n3"]);
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;
    assert_eq!(
        h.cluster.runtime(NS, "hbase").status.current_worker_number_scheduled,
        2
    );

    h.cluster
        .update_runtime_spec(NS, "hbase", |rt| rt.spec.replicas = 3);
    engine.sync_replicas().await.unwrap();

    assert!(["n1", "n2", "n3"].iter().all(|n| assigned(&h, n)));
    assert_eq!(h.cluster.statefulset_replicas(NS, "hbase-worker"), Some(3));
    assert_eq!(
        h.cluster.runtime(NS, "hbase").status.current_worker_number_scheduled,
        3
    );
}

#[ddc::test]
async fn sync_replicas_keeps_nodes_with_mounted_volume() {
    let h = Harness::new();
    seed(&h, 3, &["n1", "n2", "n3"]);
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;
    h.cluster.insert_pod(pod_with_claim("app-0", "n2", "hbase"));

    h.cluster
        .update_runtime_spec(NS, "hbase", |rt| rt.spec.replicas = 1);
    engine.sync_replicas().await.unwrap();

    assert!(assigned(&h, "n2"));
    for n in ["n1", "n3"] {
        let labels = h.cluster.node_labels(n);
        assert!(!labels.contains_key(COMMON), "{n} still assigned");
        assert!(!labels.contains_key(DATASET_NUM), "{n} still counted");
        assert!(!labels.contains_key(EXCLUSIVE), "{n} still exclusive");
    }
    assert_eq!(h.cluster.statefulset_replicas(NS, "hbase-worker"), Some(1));
    assert_eq!(
        h.cluster.runtime(NS, "hbase").status.current_worker_number_scheduled,
        1
    );
}

#[ddc::test]
async fn scale_in_ignores_finished_pods() {
    let h = Harness::new();
    seed(&h, 3, &["n1", "n2", "n3"]);
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;
    h.cluster.insert_pod(pod_with_claim("app-0", "n2", "hbase"));
    h.cluster
        .insert_pod(finished_pod_with_claim("job-0", "n1", "hbase", "Succeeded"));
    h.cluster
        .insert_pod(finished_pod_with_claim("job-1", "n3", "hbase", "Failed"));

    h.cluster
        .update_runtime_spec(NS, "hbase", |rt| rt.spec.replicas = 2);
    engine.sync_replicas().await.unwrap();

    // n1 only ran a completed job, so it goes first by name.
    assert!(!assigned(&h, "n1"));
    assert!(assigned(&h, "n2"));
    assert!(assigned(&h, "n3"));
}

#[ddc::test]
async fn scale_in_removes_least_used_node_first() {
    let h = Harness::new();
    seed(&h, 3, &["n1", "n2", "n3"]);
    h.exec.script(
        "fsadmin report capacity",
        vec![Scripted::Ok(CAPACITY_REPORT.to_string())],
    );
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;

    assert_eq!(engine.destroy_workers(2).await.unwrap(), 2);
    assert!(assigned(&h, "n1"));
    assert!(!assigned(&h, "n2"));
    assert!(assigned(&h, "n3"));
}

#[ddc::test]
async fn destroy_all_workers_returns_zero() {
    let h = Harness::new();
    seed(&h, 3, &["n1", "n2", "n3"]);
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;
    h.cluster.insert_pod(pod_with_claim("app-0", "n2", "hbase"));

    assert_eq!(engine.destroy_workers(-1).await.unwrap(), 0);
    for n in ["n1", "n2", "n3"] {
        assert!(h.cluster.node_labels(n).is_empty(), "{n} keeps labels");
    }
}

#[ddc::test]
async fn destroy_workers_never_scales_up() {
    let h = Harness::new();
    seed(&h, 2, &["n1", "n2", "n3"]);
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;

    assert_eq!(engine.destroy_workers(3).await.unwrap(), 2);
    assert!(!assigned(&h, "n3"));
}

#[ddc::test]
async fn worker_daemonset_is_tolerated() {
    let h = Harness::new();
    seed(&h, 2, &["n1"]);
    h.cluster.insert_daemonset(daemonset(NS, "hbase-worker", 1, 1));
    let mut engine = h.engine("hbase");

    let result = engine.sync_replicas().await;
    assert!(result.is_ok(), "{result:?}");
    assert!(engine.check_workers_healthy().await.is_ok());
    assert!(!assigned(&h, "n1"));
}

#[ddc::test]
async fn health_check_drives_dataset_phase() {
    let h = Harness::new();
    seed(&h, 1, &["n1"]);
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;

    let err = engine.check_runtime_healthy().await.unwrap_err();
    assert!(matches!(err, EngineError::Unhealthy { component: "workers", .. }), "got {err}");
    assert_eq!(h.cluster.dataset(NS, "hbase").status.phase, DatasetPhase::Failed);

    h.cluster.set_statefulset_ready(NS, "hbase-worker", 1);
    engine.check_runtime_healthy().await.unwrap();
    assert_eq!(h.cluster.dataset(NS, "hbase").status.phase, DatasetPhase::Bound);
    // Health checks never touch replicas.
    assert_eq!(h.cluster.statefulset_replicas(NS, "hbase-worker"), Some(1));
}

#[ddc::test]
async fn workers_ready_updates_phases() {
    let h = Harness::new();
    seed(&h, 2, &["n1", "n2"]);
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;

    h.cluster.set_statefulset_ready(NS, "hbase-worker", 1);
    assert!(engine.check_workers_ready().await.unwrap());
    let rt = h.cluster.runtime(NS, "hbase");
    assert_eq!(rt.status.worker_phase, RuntimePhase::PartialReady);
    assert_eq!(rt.status.worker_number_ready, 1);

    h.cluster.set_statefulset_ready(NS, "hbase-worker", 2);
    engine.check_workers_ready().await.unwrap();
    assert_eq!(
        h.cluster.runtime(NS, "hbase").status.worker_phase,
        RuntimePhase::Ready
    );
}

#[ddc::test]
async fn status_check_fills_cache_states() {
    let h = Harness::new();
    seed(&h, 1, &["n1"]);
    h.exec.script(
        "fsadmin report summary",
        vec![Scripted::Ok(summary("1.00GB"))],
    );
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;
    h.cluster.set_statefulset_ready(NS, "hbase-worker", 1);
    engine.check_workers_ready().await.unwrap();

    assert!(engine.check_and_update_runtime_status().await.unwrap());
    let states = h.cluster.runtime(NS, "hbase").status.cache_states;
    assert_eq!(
        states.get(&ddc::api::CacheStateName::Cached).map(String::as_str),
        Some("1GiB")
    );
    assert_eq!(
        states
            .get(&ddc::api::CacheStateName::CacheCapacity)
            .map(String::as_str),
        Some("6GiB")
    );
}

#[ddc::test]
async fn shutdown_gives_up_cleaning_after_limit() {
    let h = Harness::new();
    seed(&h, 2, &["n1", "n2"]);
    h.exec.script(
        "fsadmin report summary",
        vec![Scripted::Ok(summary("1.00GB"))],
    );
    h.exec
        .script("fs free -f /", vec![Scripted::Ok(String::new())]);
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;
    let limit = h.ctx.settings.graceful_shutdown_limits;

    for attempt in 1..=limit {
        let err = engine.shutdown().await.unwrap_err();
        assert!(matches!(err, EngineError::CacheNotCleaned { .. }), "got {err}");
        assert_eq!(engine.shutdown_attempts(), attempt);
        assert!(h.releases.is_installed(NS, "hbase"));
    }

    engine.shutdown().await.unwrap();
    assert_eq!(h.exec.calls("fs free -f /"), limit as usize);
    assert!(!h.releases.is_installed(NS, "hbase"));
    assert_eq!(h.ctx.ports.reserved_count(), 0);
    assert!(h.cluster.configmap(NS, "hbase-alluxio-values").is_none());
    assert!(!assigned(&h, "n1"));
    assert!(!assigned(&h, "n2"));
}

#[ddc::test]
async fn shutdown_cleans_cache_then_tears_down() {
    let h = Harness::new();
    seed(&h, 1, &["n1"]);
    h.exec.script(
        "fsadmin report summary",
        vec![
            Scripted::Ok(summary("1.00GB")),
            Scripted::Ok(summary("0B")),
        ],
    );
    h.exec
        .script("fs free -f /", vec![Scripted::Ok(String::new())]);
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;
    h.cluster.insert_configmap(NS, "hbase-config", Default::default());
    h.cluster.insert_node(node(
        "client",
        &[("fluid.io/f-fluid-hbase", "true")],
    ));

    engine.shutdown().await.unwrap();
    assert_eq!(engine.shutdown_attempts(), 0);
    assert_eq!(h.exec.calls("fs free -f /"), 1);
    assert_eq!(h.releases.deletes.load(Ordering::SeqCst), 1);
    assert!(h.cluster.configmap(NS, "hbase-config").is_none());
    assert!(h.cluster.node_labels("client").is_empty());
}

#[ddc::test]
async fn shutdown_skips_cleaning_when_master_is_gone() {
    let h = Harness::new();
    seed(&h, 1, &["n1"]);
    h.exec.script(
        "fsadmin report summary",
        vec![Scripted::Fail(
            "pods \"hbase-master-0\" not found".to_string(),
        )],
    );
    let mut engine = h.engine("hbase");
    provision(&h, &mut engine).await;

    engine.shutdown().await.unwrap();
    assert_eq!(h.exec.calls("fs free -f /"), 0);
    assert!(!assigned(&h, "n1"));
}

#[ddc::test]
async fn status_writes_survive_conflicts() {
    let h = Harness::new();
    seed(&h, 1, &[]);
    let mut engine = h.engine("hbase");
    h.cluster.inject_conflicts(2);

    engine.setup_master().await.unwrap();
    assert_eq!(
        h.cluster.runtime(NS, "hbase").status.master_phase,
        RuntimePhase::NotReady
    );
}

#[ddc::test]
async fn finalizer_is_added_once_and_kept_until_deletion_completes() {
    let h = Harness::new();
    seed(&h, 1, &[]);
    let engine = h.engine("hbase");
    h.cluster.inject_conflicts(1);

    engine.add_finalizer().await.unwrap();
    engine.add_finalizer().await.unwrap();
    let expected = Some(vec![finalizer_name("alluxio")]);
    assert_eq!(h.cluster.runtime(NS, "hbase").metadata.finalizers, expected);

    h.cluster.delete_runtime(NS, "hbase");
    assert!(h.cluster.has_runtime(NS, "hbase"));
    engine.complete_deletion().await.unwrap();
    assert!(!h.cluster.has_runtime(NS, "hbase"));
    assert_eq!(h.cluster.dataset(NS, "hbase").status.phase, DatasetPhase::NotBound);

    // Already gone: completing again is a no-op.
    engine.complete_deletion().await.unwrap();
}
