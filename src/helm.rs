//! Release packaging for the runtime's master, worker and fuse manifests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("{command} failed for release {release}: {stderr}")]
    CommandFailed {
        command: &'static str,
        release: String,
        stderr: String,
    },
    #[error("failed to run release tool: {0}")]
    Io(#[from] std::io::Error),
}

/// Check, install and delete packaged releases.
#[async_trait]
pub trait ReleaseManager: Send + Sync + 'static {
    async fn check_release(&self, name: &str, namespace: &str) -> Result<bool, ReleaseError>;

    async fn install_release(
        &self,
        name: &str,
        namespace: &str,
        values_file: &Path,
        chart: &str,
    ) -> Result<(), ReleaseError>;

    /// Delete the release if it exists.
    async fn delete_release(&self, name: &str, namespace: &str) -> Result<(), ReleaseError>;
}

/// Shells out to the `helm` binary.
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: PathBuf,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("helm"),
        }
    }
}

impl HelmCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn uninstall(&self, name: &str, namespace: &str) -> Result<(), ReleaseError> {
        let output = Command::new(&self.binary)
            .args(["uninstall", name, "-n", namespace])
            .output()
            .await?;
        if !output.status.success() {
            return Err(ReleaseError::CommandFailed {
                command: "uninstall",
                release: name.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReleaseManager for HelmCli {
    async fn check_release(&self, name: &str, namespace: &str) -> Result<bool, ReleaseError> {
        let output = Command::new(&self.binary)
            .args(["status", name, "-n", namespace])
            .output()
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") {
            return Ok(false);
        }
        Err(ReleaseError::CommandFailed {
            command: "status",
            release: name.to_string(),
            stderr: stderr.into_owned(),
        })
    }

    async fn install_release(
        &self,
        name: &str,
        namespace: &str,
        values_file: &Path,
        chart: &str,
    ) -> Result<(), ReleaseError> {
        let output = Command::new(&self.binary)
            .arg("install")
            .arg("-f")
            .arg(values_file)
            .args(["--namespace", namespace, name, chart])
            .output()
            .await?;
        if output.status.success() {
            info!(release = %name, namespace = %namespace, "installed release");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        // a failed install can leave a half-created release behind
        if let Err(e) = self.uninstall(name, namespace).await {
            warn!(release = %name, namespace = %namespace, error = %e, "rollback of failed install failed");
        }
        Err(ReleaseError::CommandFailed {
            command: "install",
            release: name.to_string(),
            stderr,
        })
    }

    async fn delete_release(&self, name: &str, namespace: &str) -> Result<(), ReleaseError> {
        if !self.check_release(name, namespace).await? {
            return Ok(());
        }
        self.uninstall(name, namespace).await?;
        info!(release = %name, namespace = %namespace, "deleted release");
        Ok(())
    }
}
