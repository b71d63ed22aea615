//! Holding the runtime object until its cluster state is released.
//!
//! The finalizer is added before the first reconcile. The API server then keeps
//! a deleted runtime around, marked with a deletion timestamp, until teardown
//! has freed its ports, node labels and release and the finalizer is removed.

use tracing::info;

use super::{EngineError, RuntimeEngine};
use crate::api::{CacheRuntime, CacheStates, DatasetPhase};
use crate::retry::update_with_retry;

/// `alluxio` -> `alluxio-runtime-controller-finalizer`.
pub fn finalizer_name(runtime_type: &str) -> String {
    format!("{runtime_type}-runtime-controller-finalizer")
}

impl RuntimeEngine {
    /// Make sure the runtime carries this controller's finalizer.
    pub async fn add_finalizer(&self) -> Result<(), EngineError> {
        let finalizer = finalizer_name(self.runtime_type());
        let added = self
            .update_finalizers(|finalizers| {
                if !finalizers.contains(&finalizer) {
                    finalizers.push(finalizer.clone());
                }
            })
            .await?;
        if added {
            info!(namespace = %self.namespace, runtime = %self.name, finalizer = %finalizer, "added finalizer");
        }
        Ok(())
    }

    /// Finish deleting a runtime whose teardown succeeded: unbind its dataset
    /// and drop the finalizer so the API server can remove the object.
    pub async fn complete_deletion(&self) -> Result<(), EngineError> {
        self.update_dataset_status(|ds| {
            ds.status.phase = DatasetPhase::NotBound;
            ds.status.ufs_total.clear();
            ds.status.file_num.clear();
            ds.status.cache_states = CacheStates::default();
        })
        .await?;

        let finalizer = finalizer_name(self.runtime_type());
        let result = self
            .update_finalizers(|finalizers| finalizers.retain(|f| *f != finalizer))
            .await;
        match result {
            Ok(_) => {
                info!(namespace = %self.namespace, runtime = %self.name, "removed finalizer");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Read-modify-write the finalizer list. Returns whether a write happened.
    async fn update_finalizers<M>(&self, mut mutate: M) -> Result<bool, EngineError>
    where
        M: FnMut(&mut Vec<String>),
    {
        let cluster = self.ctx.cluster.as_ref();
        let (namespace, name) = (self.namespace.as_str(), self.name.as_str());
        let outcome = update_with_retry(
            &self.ctx.retry,
            || cluster.get_runtime(namespace, name),
            |runtime: &mut CacheRuntime| {
                let mut finalizers = runtime.metadata.finalizers.take().unwrap_or_default();
                mutate(&mut finalizers);
                runtime.metadata.finalizers = (!finalizers.is_empty()).then_some(finalizers);
            },
            |runtime| cluster.update_runtime_finalizers(runtime),
        )
        .await?;
        Ok(outcome.is_updated())
    }
}
