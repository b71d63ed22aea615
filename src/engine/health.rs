use tracing::{debug, warn};

use super::{EngineError, RuntimeEngine};
use crate::api::DatasetPhase;

impl RuntimeEngine {
    fn unhealthy(&self, component: &'static str, reason: String) -> EngineError {
        EngineError::Unhealthy {
            component,
            runtime: format!("{}/{}", self.namespace, self.name),
            reason,
        }
    }

    /// The master is healthy while at least one replica is ready.
    pub async fn check_master_healthy(&self) -> Result<(), EngineError> {
        let sts = self
            .ctx
            .cluster
            .get_statefulset(&self.namespace, &self.master_name())
            .await?;
        let status = sts.status.unwrap_or_default();
        let desired = sts.spec.and_then(|s| s.replicas).unwrap_or(1);
        let ready = status.ready_replicas.unwrap_or(0);
        if desired > 0 && ready == 0 {
            return Err(self.unhealthy("master", format!("0 of {desired} replicas are ready")));
        }
        Ok(())
    }

    /// Workers are healthy unless some are wanted and none are ready.
    pub async fn check_workers_healthy(&self) -> Result<(), EngineError> {
        let sts = match self.worker_statefulset().await {
            Ok(sts) => sts,
            Err(e) if e.is_deprecated() => {
                warn!(namespace = %self.namespace, runtime = %self.name, error = %e, "skipping worker health check");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let desired = sts.spec.and_then(|s| s.replicas).unwrap_or(0);
        let ready = sts.status.and_then(|s| s.ready_replicas).unwrap_or(0);
        if desired > 0 && ready == 0 {
            return Err(self.unhealthy("workers", format!("0 of {desired} replicas are ready")));
        }
        Ok(())
    }

    /// Fuse is healthy when no scheduled pod is unavailable. A missing fuse
    /// DaemonSet has nothing to report.
    pub async fn check_fuse_healthy(&self) -> Result<(), EngineError> {
        let ds = match self
            .ctx
            .cluster
            .get_daemonset(&self.namespace, &self.fuse_name())
            .await
        {
            Ok(ds) => ds,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let status = ds.status.unwrap_or_default();
        let unavailable = status.number_unavailable.unwrap_or(0);
        if unavailable > 0 {
            return Err(self.unhealthy(
                "fuse",
                format!(
                    "{unavailable} of {} pods are unavailable",
                    status.desired_number_scheduled
                ),
            ));
        }
        Ok(())
    }

    /// Check every component and mirror the verdict on the dataset phase.
    /// Never changes replica counts.
    pub async fn check_runtime_healthy(&self) -> Result<(), EngineError> {
        let result = async {
            self.check_master_healthy().await?;
            self.check_workers_healthy().await?;
            self.check_fuse_healthy().await
        }
        .await;

        let phase = if result.is_ok() {
            DatasetPhase::Bound
        } else {
            DatasetPhase::Failed
        };
        let updated = self
            .update_dataset_status(|ds| ds.status.phase = phase)
            .await?;
        if updated.is_none() {
            debug!(namespace = %self.namespace, runtime = %self.name, "no dataset to mark {phase:?}");
        }
        result
    }
}
