//! Cache engine admin commands, run inside the master container.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::exec::{ExecError, ExecOutput, RemoteExec};
use crate::units::parse_human_size;

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("unexpected output from `{command}`: {output}")]
    Parse { command: String, output: String },
}

/// Cluster-wide cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSummary {
    pub total_capacity: u64,
    pub used_capacity: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileCount {
    pub files: u64,
    pub folders: u64,
    pub total_bytes: u64,
}

/// Admin commands against one runtime's cache engine.
#[derive(Clone)]
pub struct CacheFileUtils {
    exec: Arc<dyn RemoteExec>,
    namespace: String,
    pod: String,
    container: String,
    cli: String,
    timeout: Duration,
}

impl CacheFileUtils {
    pub fn new(
        exec: Arc<dyn RemoteExec>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
        cli: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            exec,
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
            cli: cli.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<ExecOutput, ExecError> {
        let mut command = vec![self.cli.clone()];
        command.extend(args.iter().map(|a| a.to_string()));
        self.exec_command(command).await
    }

    async fn exec_command(&self, command: Vec<String>) -> Result<ExecOutput, ExecError> {
        let out = self
            .exec
            .exec(
                &self.namespace,
                &self.pod,
                &self.container,
                &command,
                self.timeout,
            )
            .await?;
        debug!(pod = %self.pod, command = ?command, "cache engine command finished");
        Ok(out)
    }

    pub async fn report_summary(&self) -> Result<CacheSummary, OperationError> {
        let out = self.run(&["fsadmin", "report", "summary"]).await?;
        parse_summary(&out.stdout)
    }

    /// Per-worker used capacity keyed by worker address.
    pub async fn report_capacity(&self) -> Result<BTreeMap<String, u64>, OperationError> {
        let out = self.run(&["fsadmin", "report", "capacity"]).await?;
        parse_worker_usage(&out.stdout)
    }

    pub async fn count(&self, path: &str) -> Result<FileCount, OperationError> {
        let out = self.run(&["fs", "count", path]).await?;
        parse_count(&out.stdout)
    }

    /// Load metadata for the whole tree under `path` from the under storage.
    pub async fn load_metadata(&self, path: &str) -> Result<(), OperationError> {
        self.run(&["fs", "loadMetadata", "-R", path]).await?;
        Ok(())
    }

    /// Evict cached blocks under `path`.
    pub async fn free(&self, path: &str) -> Result<(), OperationError> {
        self.run(&["fs", "free", "-f", path]).await?;
        Ok(())
    }

    /// Walk a directory mounted into the container so its listing is warm
    /// before the cache engine loads metadata from it.
    pub async fn sync_local_dir(&self, path: &str) -> Result<(), OperationError> {
        self.exec_command(vec!["du".to_string(), "-sh".to_string(), path.to_string()])
            .await?;
        Ok(())
    }

    /// Read the info file stored next to a metadata backup.
    pub async fn read_backup_info(&self, file: &str) -> Result<BackupInfo, OperationError> {
        let out = self
            .exec_command(vec!["cat".to_string(), file.to_string()])
            .await?;
        parse_backup_info(&out.stdout)
    }
}

/// UFS totals recorded when a dataset's metadata was backed up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupInfo {
    pub ufs_total_bytes: u64,
    pub file_num: String,
}

fn parse_error(command: &str, output: &str) -> OperationError {
    OperationError::Parse {
        command: command.to_string(),
        output: output.chars().take(256).collect(),
    }
}

/// Parse a backup info file:
///
/// ```text
/// dataset: hbase
/// namespace: fluid
/// ufstotal: 2147483648
/// filenum: 3
/// ```
pub fn parse_backup_info(stdout: &str) -> Result<BackupInfo, OperationError> {
    let mut ufs_total = None;
    let mut file_num = None;
    for line in stdout.lines() {
        match line.split_once(':') {
            Some(("ufstotal", value)) => ufs_total = value.trim().parse::<f64>().ok(),
            Some(("filenum", value)) => file_num = Some(value.trim().to_string()),
            _ => {}
        }
    }
    match (ufs_total, file_num) {
        (Some(total), Some(files)) if total >= 0.0 && !files.is_empty() => Ok(BackupInfo {
            ufs_total_bytes: total as u64,
            file_num: files,
        }),
        _ => Err(parse_error("cat <backup info>", stdout)),
    }
}

/// Parse `Total Capacity:` and `Used Capacity:` out of the summary report.
pub fn parse_summary(stdout: &str) -> Result<CacheSummary, OperationError> {
    let mut total = None;
    let mut used = None;
    for line in stdout.lines().map(str::trim) {
        if let Some(v) = line.strip_prefix("Total Capacity:") {
            total = parse_human_size(v).ok();
        } else if let Some(v) = line.strip_prefix("Used Capacity:") {
            used = parse_human_size(v).ok();
        }
    }
    match (total, used) {
        (Some(total_capacity), Some(used_capacity)) => Ok(CacheSummary {
            total_capacity,
            used_capacity,
        }),
        _ => Err(parse_error("report summary", stdout)),
    }
}

/// Parse the second line of `fs count`: files, folders, bytes.
pub fn parse_count(stdout: &str) -> Result<FileCount, OperationError> {
    let fields: Vec<u64> = stdout
        .lines()
        .nth(1)
        .map(|l| l.split_whitespace().filter_map(|f| f.parse().ok()).collect())
        .unwrap_or_default();
    match fields.as_slice() {
        [files, folders, total_bytes, ..] => Ok(FileCount {
            files: *files,
            folders: *folders,
            total_bytes: *total_bytes,
        }),
        _ => Err(parse_error("count", stdout)),
    }
}

/// Parse the worker table of the capacity report.
///
/// ```text
/// Worker Name      Last Heartbeat   Storage       MEM
/// 192.168.1.147    0                capacity      2048.00MB
///                                   used          443.89MB (21%)
/// ```
pub fn parse_worker_usage(stdout: &str) -> Result<BTreeMap<String, u64>, OperationError> {
    let mut usage = BTreeMap::new();
    let mut in_table = false;
    let mut current: Option<String> = None;
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() == Some(&"Worker") && fields.get(1) == Some(&"Name") {
            in_table = true;
            continue;
        }
        if !in_table || fields.is_empty() {
            continue;
        }
        if fields[0] == "used" {
            let worker = current.take().ok_or_else(|| parse_error("report capacity", stdout))?;
            let size = fields
                .get(1)
                .and_then(|s| parse_human_size(s).ok())
                .ok_or_else(|| parse_error("report capacity", stdout))?;
            usage.insert(worker, size);
        } else if fields.get(2) == Some(&"capacity") {
            current = Some(fields[0].to_string());
        }
    }
    if !in_table {
        return Err(parse_error("report capacity", stdout));
    }
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_summary_report() {
        let out = "Alluxio cluster summary:\n    Master Address: 10.0.0.1:19998\n    Total Capacity: 4.00GB\n        Tier: MEM  Size: 4.00GB\n    Used Capacity: 1.00GB\n        Tier: MEM  Size: 1.00GB\n";
        let s = parse_summary(out).unwrap();
        assert_eq!(s.total_capacity, 4 << 30);
        assert_eq!(s.used_capacity, 1 << 30);
        assert!(parse_summary("nothing here").is_err());
    }

    #[test]
    fn parses_backup_info() {
        let info = parse_backup_info("dataset: hbase\nnamespace: fluid\nufstotal: 2147483648\nfilenum: 3\n")
            .unwrap();
        assert_eq!(
            info,
            BackupInfo {
                ufs_total_bytes: 2147483648,
                file_num: "3".to_string(),
            }
        );
        assert!(parse_backup_info("dataset: hbase\nufstotal: lots\nfilenum: 3\n").is_err());
        assert!(parse_backup_info("").is_err());
    }

    #[test]
    fn parses_count_output() {
        let out = "File Count               Folder Count             Folder Size\n6                        1                        571808\n";
        assert_eq!(
            parse_count(out).unwrap(),
            FileCount {
                files: 6,
                folders: 1,
                total_bytes: 571808
            }
        );
        assert!(parse_count("File Count\n").is_err());
    }

    #[test]
    fn parses_capacity_report() {
        let out = "Capacity information for all workers:\n    Total Capacity: 4096.00MB\n    Used Capacity: 443.89MB\n\nWorker Name      Last Heartbeat   Storage       MEM\n192.168.1.147    0                capacity      2048.00MB\n                                  used          443.89MB (21%)\n192.168.1.146    0                capacity      2048.00MB\n                                  used          0B (0%)\n";
        let usage = parse_worker_usage(out).unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage["192.168.1.146"], 0);
        assert!(usage["192.168.1.147"] > 400 << 20);
    }
}
