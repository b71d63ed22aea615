use std::time::Instant;

use tracing::{debug, info, warn};

use super::{EngineError, RuntimeEngine};
use crate::inflight::PollResult;
use crate::units::bytes_size;

/// Dataset status value while the UFS total is being computed.
pub const CALCULATING: &str = "[Calculating]";

/// Where claim and host-path mounts land inside the master container.
const LOCAL_STORAGE_DIR: &str = "/underFSStorage";

/// What one background metadata sync produced.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataSyncResult {
    pub done: bool,
    pub start_time: Instant,
    /// Formatted UFS total, e.g. `2GiB`.
    pub ufs_total: String,
    pub ufs_total_bytes: u64,
    pub file_num: String,
    pub err: Option<String>,
}

impl MetadataSyncResult {
    fn failed(start_time: Instant, err: String) -> Self {
        Self {
            done: false,
            start_time,
            ufs_total: String::new(),
            ufs_total_bytes: 0,
            file_num: String::new(),
            err: Some(err),
        }
    }
}

fn is_final(ufs_total: &str) -> bool {
    !ufs_total.is_empty() && ufs_total != CALCULATING
}

/// Where the info file of a metadata backup shows up inside the master.
///
/// Backups on a claim are mounted under `/pvc`, host directories under `/host`.
fn backup_info_path(location: &str, name: &str, namespace: &str) -> Option<String> {
    let file = format!("{name}-{namespace}.yaml");
    if let Some(rest) = location.strip_prefix("pvc://") {
        let (claim, dir) = rest.split_once('/').unwrap_or((rest, ""));
        if claim.is_empty() {
            return None;
        }
        let dir = dir.trim_matches('/');
        return Some(if dir.is_empty() {
            format!("/pvc/{file}")
        } else {
            format!("/pvc/{dir}/{file}")
        });
    }
    location
        .strip_prefix("local://")
        .map(|_| format!("/host/{file}"))
}

impl RuntimeEngine {
    /// Whether the dataset still needs its UFS total computed.
    pub async fn should_sync_metadata(&self) -> Result<bool, EngineError> {
        if !self.ctx.settings.query_ufs_total {
            return Ok(false);
        }
        let runtime = self.get_runtime().await?;
        let auto_sync = runtime
            .spec
            .management
            .metadata_sync_policy
            .auto_sync
            .unwrap_or(self.ctx.settings.auto_sync);
        if !auto_sync {
            return Ok(false);
        }
        Ok(match self.get_dataset().await? {
            Some(ds) => !is_final(&ds.status.ufs_total),
            None => false,
        })
    }

    /// Start a background sync if needed and collect its result if it is ready.
    ///
    /// Never waits longer than the configured poll timeout. A job that is still
    /// running leaves the dataset at the calculating sentinel until a later pass.
    pub async fn sync_metadata(&mut self) -> Result<(), EngineError> {
        if !self.metadata_job.is_pending() {
            if !self.should_sync_metadata().await? {
                return Ok(());
            }
            match self.restore_metadata().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    warn!(namespace = %self.namespace, dataset = %self.name, error = %e, "cannot restore metadata totals from backup, syncing from under storage");
                }
            }
            self.update_dataset_status(|ds| {
                ds.status.ufs_total = CALCULATING.to_string();
                ds.status.file_num = CALCULATING.to_string();
            })
            .await?;

            let local_dirs: Vec<String> = self
                .get_dataset()
                .await?
                .map(|ds| ds.spec.mounts)
                .unwrap_or_default()
                .iter()
                .filter(|m| m.is_native())
                .map(|m| format!("{LOCAL_STORAGE_DIR}/{}", m.name))
                .collect();
            let utils = self.file_utils();
            let started = self.metadata_job.start(async move {
                let start_time = Instant::now();
                for dir in &local_dirs {
                    info!(path = %dir, "syncing local dir");
                    if let Err(e) = utils.sync_local_dir(dir).await {
                        return MetadataSyncResult::failed(start_time, format!("sync local dir {dir}: {e}"));
                    }
                }
                if let Err(e) = utils.load_metadata("/").await {
                    return MetadataSyncResult::failed(start_time, e.to_string());
                }
                match utils.count("/").await {
                    Ok(count) => MetadataSyncResult {
                        done: true,
                        start_time,
                        ufs_total: bytes_size(count.total_bytes as f64),
                        ufs_total_bytes: count.total_bytes,
                        file_num: count.files.to_string(),
                        err: None,
                    },
                    Err(e) => MetadataSyncResult::failed(start_time, e.to_string()),
                }
            });
            if started {
                info!(namespace = %self.namespace, dataset = %self.name, "started metadata sync");
            }
        }

        match self
            .metadata_job
            .poll(self.ctx.settings.metadata_poll_timeout)
            .await
        {
            PollResult::Idle | PollResult::Pending => {
                debug!(namespace = %self.namespace, dataset = %self.name, "metadata sync still running");
                Ok(())
            }
            PollResult::Abandoned => {
                warn!(namespace = %self.namespace, dataset = %self.name, "metadata sync ended without a result, retrying next pass");
                Ok(())
            }
            PollResult::Ready(result) => self.apply_metadata_result(result).await,
        }
    }

    /// Take the UFS totals from the dataset's metadata backup, if it names one.
    /// Returns whether the totals were restored.
    async fn restore_metadata(&self) -> Result<bool, EngineError> {
        let Some(dataset) = self.get_dataset().await? else {
            return Ok(false);
        };
        let Some(location) = dataset.spec.data_restore_location else {
            return Ok(false);
        };
        let file = backup_info_path(&location.path, &self.name, &self.namespace).ok_or_else(|| {
            EngineError::MetadataSync(
                format!("{}/{}", self.namespace, self.name),
                format!("unsupported restore location {:?}", location.path),
            )
        })?;
        let backup = self.file_utils().read_backup_info(&file).await?;
        let ufs_total = bytes_size(backup.ufs_total_bytes as f64);
        self.update_dataset_status(|ds| {
            ds.status.ufs_total = ufs_total.clone();
            ds.status.file_num = backup.file_num.clone();
        })
        .await?;
        info!(
            namespace = %self.namespace,
            dataset = %self.name,
            file = %file,
            ufs_total = %ufs_total,
            file_num = %backup.file_num,
            "restored metadata totals from backup"
        );
        Ok(true)
    }

    async fn apply_metadata_result(&self, result: MetadataSyncResult) -> Result<(), EngineError> {
        let elapsed = result.start_time.elapsed();
        if !result.done {
            let err = result.err.unwrap_or_else(|| "unknown error".to_string());
            return Err(EngineError::MetadataSync(
                format!("{}/{}", self.namespace, self.name),
                err,
            ));
        }
        self.update_dataset_status(|ds| {
            ds.status.ufs_total = result.ufs_total.clone();
            ds.status.file_num = result.file_num.clone();
        })
        .await?;
        if let Some(metrics) = &self.ctx.metrics {
            let files = result.file_num.parse().unwrap_or(0);
            metrics.record_metadata_sync(
                &self.namespace,
                &self.name,
                result.ufs_total_bytes,
                files,
                elapsed.as_secs_f64(),
            );
        }
        info!(
            namespace = %self.namespace,
            dataset = %self.name,
            ufs_total = %result.ufs_total,
            file_num = %result.file_num,
            elapsed_ms = elapsed.as_millis() as u64,
            "metadata sync finished"
        );
        Ok(())
    }
}
