use tracing::{debug, warn};

use super::{EngineError, RuntimeEngine};

/// Where a reconcile pass left the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Some component is not serving yet; run again next period.
    Progressing,
    /// Every component is serving.
    Ready,
}

impl RuntimeEngine {
    /// One pass over the lifecycle steps, in order. Every step is idempotent,
    /// so a pass that stops on an error is simply re-driven next period.
    pub async fn reconcile(&mut self) -> Result<ReconcileOutcome, EngineError> {
        let r = self.refresh_runtime_info().await.map(|_| ());
        self.record_step("runtime_info", &r);
        r?;

        let runtime = self.get_runtime().await?;
        if Self::should_setup_master(&runtime) {
            let r = self.setup_master().await;
            self.record_step("setup_master", &r);
            r?;
        }
        let r = self.check_master_ready().await;
        self.record_step("check_master_ready", &r);
        if !r? {
            debug!(namespace = %self.namespace, runtime = %self.name, "waiting for master");
            return Ok(ReconcileOutcome::Progressing);
        }

        let runtime = self.get_runtime().await?;
        if Self::should_setup_workers(&runtime) {
            let r = self.setup_workers().await;
            self.record_step("setup_workers", &r);
            tolerate_deprecated(r, "setup_workers")?;
        }
        let r = self.check_workers_ready().await;
        self.record_step("check_workers_ready", &r);
        let workers_ready = tolerate_deprecated(r, "check_workers_ready")?.unwrap_or(true);

        let r = self.sync_replicas().await;
        self.record_step("sync_replicas", &r);
        r?;
        if !workers_ready {
            debug!(namespace = %self.namespace, runtime = %self.name, "waiting for workers");
            return Ok(ReconcileOutcome::Progressing);
        }

        let r = self.check_runtime_healthy().await;
        self.record_step("check_runtime_healthy", &r);
        r?;

        let r = self.sync_metadata().await;
        self.record_step("sync_metadata", &r);
        r?;

        let r = self.check_and_update_runtime_status().await;
        self.record_step("update_runtime_status", &r);
        Ok(if r? {
            ReconcileOutcome::Ready
        } else {
            ReconcileOutcome::Progressing
        })
    }
}

/// Deprecated layouts are a warning, not a failure. Returns None in that case.
fn tolerate_deprecated<T>(r: Result<T, EngineError>, step: &str) -> Result<Option<T>, EngineError> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_deprecated() => {
            warn!(step, error = %e, "deprecated runtime layout, skipping");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
