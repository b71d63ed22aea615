//! Running commands inside runtime containers.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use tokio::io::AsyncReadExt;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("command {command:?} in pod {pod} timed out after {after:?}")]
    Timeout {
        pod: String,
        command: String,
        after: Duration,
    },
    #[error("command {command:?} in pod {pod} failed: {message}; stderr: {stderr}")]
    Failed {
        pod: String,
        command: String,
        message: String,
        stderr: String,
    },
    #[error("exec backend error: {0}")]
    Backend(String),
}

impl ExecError {
    /// Text to search when classifying a failure.
    pub fn detail(&self) -> String {
        match self {
            ExecError::Failed {
                message, stderr, ..
            } => format!("{message} {stderr}"),
            other => other.to_string(),
        }
    }
}

/// Executes a command in a container and returns its output.
#[async_trait]
pub trait RemoteExec: Send + Sync + 'static {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError>;
}

/// Exec through the Kubernetes API server's websocket endpoint.
#[derive(Clone)]
pub struct KubeExec {
    client: kube::Client,
}

impl KubeExec {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    async fn run(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, ExecError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = pods
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| ExecError::Backend(e.to_string()))?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let status = attached.take_status();

        let read_stdout = async {
            let mut out = String::new();
            if let Some(mut r) = stdout_reader {
                r.read_to_string(&mut out).await?;
            }
            Ok::<_, std::io::Error>(out)
        };
        let read_stderr = async {
            let mut out = String::new();
            if let Some(mut r) = stderr_reader {
                r.read_to_string(&mut out).await?;
            }
            Ok::<_, std::io::Error>(out)
        };
        let (stdout, stderr) = tokio::join!(read_stdout, read_stderr);
        let output = ExecOutput {
            stdout: stdout.map_err(|e| ExecError::Backend(e.to_string()))?,
            stderr: stderr.map_err(|e| ExecError::Backend(e.to_string()))?,
        };

        let status = match status {
            Some(fut) => fut.await,
            None => None,
        };
        match status {
            Some(s) if s.status.as_deref() != Some("Success") => Err(ExecError::Failed {
                pod: pod.to_string(),
                command: command.join(" "),
                message: s.message.unwrap_or_default(),
                stderr: output.stderr,
            }),
            _ => Ok(output),
        }
    }
}

#[async_trait]
impl RemoteExec for KubeExec {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        debug!(namespace = %namespace, pod = %pod, command = ?command, "exec");
        match tokio::time::timeout(timeout, self.run(namespace, pod, container, command)).await {
            Ok(result) => result,
            Err(_) => Err(ExecError::Timeout {
                pod: pod.to_string(),
                command: command.join(" "),
                after: timeout,
            }),
        }
    }
}
