use tracing::warn;

use super::metadata::CALCULATING;
use super::phase::{classify_phase, is_serving};
use super::{EngineError, RuntimeEngine};
use crate::api::{CacheStateName, CacheStates, RuntimePhase};
use crate::operations::CacheSummary;
use crate::units::{bytes_size, parse_human_size};

/// Replica counts read from one workload.
#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    desired: i32,
    current: i32,
    ready: i32,
    available: i32,
}

fn cache_states(summary: &CacheSummary, ufs_total: &str) -> CacheStates {
    let mut states = CacheStates::new();
    states.insert(
        CacheStateName::CacheCapacity,
        bytes_size(summary.total_capacity as f64),
    );
    states.insert(
        CacheStateName::Cached,
        bytes_size(summary.used_capacity as f64),
    );
    if ufs_total != CALCULATING {
        if let Ok(total) = parse_human_size(ufs_total) {
            if total > 0 {
                let pct = summary.used_capacity as f64 * 100.0 / total as f64;
                states.insert(CacheStateName::CachedPercentage, format!("{pct:.1}%"));
            }
        }
    }
    states
}

impl RuntimeEngine {
    async fn master_counts(&self, desired: i32) -> Result<Counts, EngineError> {
        match self
            .ctx
            .cluster
            .get_statefulset(&self.namespace, &self.master_name())
            .await
        {
            Ok(sts) => {
                let s = sts.status.unwrap_or_default();
                Ok(Counts {
                    desired,
                    current: s.replicas,
                    ready: s.ready_replicas.unwrap_or(0),
                    available: s.available_replicas.unwrap_or(0),
                })
            }
            Err(e) if e.is_not_found() => Ok(Counts {
                desired,
                ..Default::default()
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh replica counts, phases and cache states in the runtime status.
    /// Returns whether both master and workers are serving.
    pub async fn check_and_update_runtime_status(&mut self) -> Result<bool, EngineError> {
        let runtime = self.get_runtime().await?;
        let master = self.master_counts(runtime.master_replicas()).await?;

        let workers = match self.worker_statefulset().await {
            Ok(sts) => {
                let s = sts.status.unwrap_or_default();
                Some(Counts {
                    desired: runtime.spec.replicas,
                    current: s.replicas,
                    ready: s.ready_replicas.unwrap_or(0),
                    available: s.available_replicas.unwrap_or(0),
                })
            }
            Err(e) if e.is_deprecated() || e.is_not_found() => {
                warn!(namespace = %self.namespace, runtime = %self.name, error = %e, "worker counts unavailable");
                None
            }
            Err(e) => return Err(e),
        };

        let ufs_total = self
            .get_dataset()
            .await?
            .map(|ds| ds.status.ufs_total)
            .unwrap_or_default();
        let states = match self.file_utils().report_summary().await {
            Ok(summary) => Some(cache_states(&summary, &ufs_total)),
            Err(e) => {
                warn!(namespace = %self.namespace, runtime = %self.name, error = %e, "cannot read cache report");
                None
            }
        };

        let master_phase = classify_phase(master.desired, master.ready);
        let worker_phase = workers.map(|w| classify_phase(w.desired, w.ready));
        let ready = is_serving(master_phase) && worker_phase.is_some_and(is_serving);

        self.update_runtime_status(|rt| {
            let status = &mut rt.status;
            status.master_phase = master_phase;
            status.current_master_number_scheduled = master.current;
            status.master_number_ready = master.ready;
            if let (Some(w), Some(phase)) = (workers, worker_phase) {
                // An unset phase belongs to worker setup.
                if status.worker_phase != RuntimePhase::None {
                    status.worker_phase = phase;
                }
                status.worker_number_ready = w.ready;
                status.worker_number_available = w.available;
            }
            if let Some(states) = &states {
                status.cache_states = states.clone();
            }
        })
        .await?;
        Ok(ready)
    }
}
