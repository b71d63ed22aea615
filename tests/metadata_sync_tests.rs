
use std::time::Duration;

use ddc::api::{DataRestoreLocation, Mount, PlacementMode};
use ddc::engine::{CALCULATING, EngineError, RuntimeEngine};

use test_helpers::*;

const LOAD: &str = "fs loadMetadata -R /";
const COUNT: &str = "fs count /";
const COUNT_OUTPUT: &str = "File Count   Folder Count   Folder Size\n3   1   2147483648\n";

fn seed(h: &Harness) {
    h.cluster.insert_runtime(runtime("hbase", 1));
    h.cluster
        .insert_dataset(dataset("hbase", PlacementMode::Exclusive));
}

fn ufs(h: &Harness) -> (String, String) {
    let status = h.cluster.dataset(NS, "hbase").status;
    (status.ufs_total, status.file_num)
}

/// Drive passes until the running sync has reported back.
async fn drain(engine: &mut RuntimeEngine) -> Result<(), EngineError> {
    loop {
        let r = engine.sync_metadata().await;
        if !engine.is_metadata_sync_pending() {
            return r;
        }
        r?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("metadata sync did not finish")
}

#[ddc::test]
async fn slow_sync_reports_sentinel_then_totals() {
    let h = Harness::new();
    seed(&h);
    h.exec.script(LOAD, vec![Scripted::Ok(String::new())]);
    h.exec
        .script(COUNT, vec![Scripted::Ok(COUNT_OUTPUT.to_string())]);
    h.exec.set_delay(COUNT, Duration::from_millis(300));
    let mut engine = h.engine("hbase");

    engine.sync_metadata().await.unwrap();
    assert!(engine.is_metadata_sync_pending());
    assert_eq!(ufs(&h), (CALCULATING.to_string(), CALCULATING.to_string()));

    // A pass while the job runs does not start another one.
    engine.sync_metadata().await.unwrap();
    assert_eq!(ufs(&h).0, CALCULATING);

    within(drain(&mut engine)).await.unwrap();
    assert_eq!(ufs(&h), ("2GiB".to_string(), "3".to_string()));
    assert_eq!(h.exec.calls(LOAD), 1);
    assert_eq!(h.exec.calls(COUNT), 1);

    // A final total is never recomputed.
    engine.sync_metadata().await.unwrap();
    assert!(!engine.is_metadata_sync_pending());
    assert_eq!(h.exec.calls(LOAD), 1);
}

#[ddc::test]
async fn failed_sync_is_retried_next_pass() {
    let h = Harness::new();
    seed(&h);
    h.exec.script(
        LOAD,
        vec![
            Scripted::Fail("under storage unreachable".to_string()),
            Scripted::Ok(String::new()),
        ],
    );
    h.exec
        .script(COUNT, vec![Scripted::Ok(COUNT_OUTPUT.to_string())]);
    let mut engine = h.engine("hbase");

    let err = within(drain(&mut engine)).await.unwrap_err();
    assert!(matches!(err, EngineError::MetadataSync(..)), "got {err}");
    assert_eq!(ufs(&h).0, CALCULATING);

    within(drain(&mut engine)).await.unwrap();
    assert_eq!(ufs(&h), ("2GiB".to_string(), "3".to_string()));
    assert_eq!(h.exec.calls(LOAD), 2);
}

#[ddc::test]
async fn disabled_ufs_query_leaves_dataset_alone() {
    let mut h = Harness::new();
    h.ctx.settings.query_ufs_total = false;
    seed(&h);
    let mut engine = h.engine("hbase");

    assert!(!engine.should_sync_metadata().await.unwrap());
    engine.sync_metadata().await.unwrap();
    assert!(!engine.is_metadata_sync_pending());
    assert_eq!(ufs(&h), (String::new(), String::new()));
    assert_eq!(h.exec.calls(LOAD), 0);
}

#[ddc::test]
async fn runtime_can_turn_auto_sync_off() {
    let h = Harness::new();
    let mut rt = runtime("hbase", 1);
    rt.spec.management.metadata_sync_policy.auto_sync = Some(false);
    h.cluster.insert_runtime(rt);
    h.cluster
        .insert_dataset(dataset("hbase", PlacementMode::Exclusive));
    let mut engine = h.engine("hbase");

    engine.sync_metadata().await.unwrap();
    assert!(!engine.is_metadata_sync_pending());
    assert_eq!(ufs(&h).0, "");
}

#[ddc::test]
async fn missing_dataset_skips_sync() {
    let h = Harness::new();
    h.cluster.insert_runtime(runtime("hbase", 1));
    let engine = h.engine("hbase");

    assert!(!engine.should_sync_metadata().await.unwrap());
}

fn seed_with_backup(h: &Harness, path: &str) {
    h.cluster.insert_runtime(runtime("hbase", 1));
    let mut ds = dataset("hbase", PlacementMode::Exclusive);
    ds.spec.data_restore_location = Some(DataRestoreLocation {
        path: path.to_string(),
        node_name: None,
    });
    h.cluster.insert_dataset(ds);
}

const BACKUP_INFO: &str = "cat /pvc/backups/hbase-fluid.yaml";

#[ddc::test]
async fn totals_are_restored_from_backup() {
    let h = Harness::new();
    seed_with_backup(&h, "pvc://backup-pvc/backups");
    h.exec.script(
        BACKUP_INFO,
        vec![Scripted::Ok(
            "dataset: hbase\nnamespace: fluid\nufstotal: 2147483648\nfilenum: 3\n".to_string(),
        )],
    );
    let mut engine = h.engine("hbase");

    engine.sync_metadata().await.unwrap();
    assert!(!engine.is_metadata_sync_pending());
    assert_eq!(ufs(&h), ("2GiB".to_string(), "3".to_string()));
    assert_eq!(h.exec.calls(BACKUP_INFO), 1);
    assert_eq!(h.exec.calls(LOAD), 0);
}

#[ddc::test]
async fn unreadable_backup_falls_back_to_live_sync() {
    let h = Harness::new();
    seed_with_backup(&h, "pvc://backup-pvc/backups");
    h.exec.script(
        BACKUP_INFO,
        vec![Scripted::Fail("No such file or directory".to_string())],
    );
    h.exec.script(LOAD, vec![Scripted::Ok(String::new())]);
    h.exec
        .script(COUNT, vec![Scripted::Ok(COUNT_OUTPUT.to_string())]);
    let mut engine = h.engine("hbase");

    within(drain(&mut engine)).await.unwrap();
    assert_eq!(ufs(&h), ("2GiB".to_string(), "3".to_string()));
    assert_eq!(h.exec.calls(BACKUP_INFO), 1);
    assert_eq!(h.exec.calls(LOAD), 1);
}

fn seed_with_mounts(h: &Harness) {
    h.cluster.insert_runtime(runtime("hbase", 1));
    let mut ds = dataset("hbase", PlacementMode::Exclusive);
    ds.spec.mounts = vec![
        Mount {
            name: "remote".to_string(),
            mount_point: "s3://bucket/hbase".to_string(),
        },
        Mount {
            name: "claim".to_string(),
            mount_point: "pvc://hbase-data/dir".to_string(),
        },
    ];
    h.cluster.insert_dataset(ds);
}

const SYNC_CLAIM: &str = "du -sh /underFSStorage/claim";

#[ddc::test]
async fn native_mounts_are_synced_before_loading_metadata() {
    let h = Harness::new();
    seed_with_mounts(&h);
    h.exec.script(SYNC_CLAIM, vec![Scripted::Ok("4.0K\t/underFSStorage/claim\n".to_string())]);
    h.exec.script(LOAD, vec![Scripted::Ok(String::new())]);
    h.exec
        .script(COUNT, vec![Scripted::Ok(COUNT_OUTPUT.to_string())]);
    let mut engine = h.engine("hbase");

    within(drain(&mut engine)).await.unwrap();
    assert_eq!(ufs(&h), ("2GiB".to_string(), "3".to_string()));
    assert_eq!(h.exec.calls(SYNC_CLAIM), 1);
    assert_eq!(h.exec.calls("du -sh /underFSStorage/remote"), 0);
    assert_eq!(h.exec.calls(LOAD), 1);
}

#[ddc::test]
async fn failed_local_dir_sync_fails_the_pass() {
    let h = Harness::new();
    seed_with_mounts(&h);
    h.exec.script(
        SYNC_CLAIM,
        vec![Scripted::Fail("du: cannot access '/underFSStorage/claim'".to_string())],
    );
    h.exec.script(LOAD, vec![Scripted::Ok(String::new())]);
    let mut engine = h.engine("hbase");

    let err = within(drain(&mut engine)).await.unwrap_err();
    assert!(matches!(err, EngineError::MetadataSync(..)), "got {err}");
    assert_eq!(ufs(&h).0, CALCULATING);
    assert_eq!(h.exec.calls(LOAD), 0);
}
