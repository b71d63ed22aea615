use tracing::{info, warn};

use super::{EngineError, RuntimeEngine};
use crate::labels::flag_selector;
use crate::node_ledger::{self, node_name};
use crate::operations::OperationError;
use crate::port_parser::{VALUES_KEY, parse_ports_from_values, values_configmap_name};
use crate::units::bytes_size;

/// Exec failures that mean the master is already gone, so there is no cache to clean.
const GONE_MARKERS: &[&str] = &["not found", "does not have a host assigned"];

fn master_is_gone(err: &OperationError) -> bool {
    match err {
        OperationError::Exec(e) => {
            let detail = e.detail();
            GONE_MARKERS.iter().any(|m| detail.contains(m))
        }
        OperationError::Parse { .. } => false,
    }
}

impl RuntimeEngine {
    /// Tear the runtime down.
    ///
    /// Cache cleanup is attempted once per call. A failed attempt is counted and
    /// returned so the caller retries on the next pass; once the configured limit
    /// of failed attempts is reached teardown proceeds without it.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.metadata_job.cancel();

        let limit = self.ctx.settings.graceful_shutdown_limits;
        if self.retry_shutdown < limit {
            if let Err(e) = self.clean_cache().await {
                self.retry_shutdown += 1;
                warn!(
                    namespace = %self.namespace,
                    runtime = %self.name,
                    attempt = self.retry_shutdown,
                    limit,
                    error = %e,
                    "cache cleanup failed"
                );
                return Err(e);
            }
        } else {
            warn!(namespace = %self.namespace, runtime = %self.name, limit, "cache cleanup retries exhausted, tearing down anyway");
        }

        let remaining = self.destroy_workers(-1).await?;
        self.release_ports().await?;
        self.destroy_master().await?;
        self.clean_all().await?;
        let fuses = self.clean_fuse().await?;
        info!(namespace = %self.namespace, runtime = %self.name, remaining, fuses_cleaned = fuses, "runtime shut down");
        Ok(())
    }

    /// Free every cached block and verify nothing is left.
    pub async fn clean_cache(&self) -> Result<(), EngineError> {
        let utils = self.file_utils();
        let before = match utils.report_summary().await {
            Ok(summary) => summary,
            Err(e) if master_is_gone(&e) => {
                info!(namespace = %self.namespace, runtime = %self.name, error = %e, "master is gone, no cache to clean");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if before.used_capacity == 0 {
            return Ok(());
        }

        utils.free("/").await?;
        let after = utils.report_summary().await?;
        if after.used_capacity > 0 {
            return Err(EngineError::CacheNotCleaned {
                runtime: format!("{}/{}", self.namespace, self.name),
                cached: bytes_size(after.used_capacity as f64),
            });
        }
        info!(namespace = %self.namespace, runtime = %self.name, freed = %bytes_size(before.used_capacity as f64), "cleaned cache");
        Ok(())
    }

    /// Uninstall the release. A release that is already gone is fine.
    pub async fn destroy_master(&self) -> Result<(), EngineError> {
        self.ctx
            .releases
            .delete_release(&self.name, &self.namespace)
            .await?;
        Ok(())
    }

    /// Give back the ports recorded in the values ConfigMap.
    pub async fn release_ports(&self) -> Result<(), EngineError> {
        let cm_name = values_configmap_name(&self.name, self.runtime_type());
        let Some(cm) = self
            .ctx
            .cluster
            .get_configmap(&self.namespace, &cm_name)
            .await?
        else {
            info!(namespace = %self.namespace, configmap = %cm_name, "no values recorded, no ports to release");
            return Ok(());
        };
        let Some(values) = cm.data.as_ref().and_then(|d| d.get(VALUES_KEY)) else {
            return Ok(());
        };
        let ports = parse_ports_from_values(values)?;
        self.ctx.ports.release_reserved_ports(&ports);
        if let Some(metrics) = &self.ctx.metrics {
            metrics.set_ports_reserved(self.ctx.ports.reserved_count());
        }
        info!(namespace = %self.namespace, runtime = %self.name, ports = ?ports, "released ports");
        Ok(())
    }

    /// Delete the ConfigMaps the runtime leaves behind.
    pub async fn clean_all(&self) -> Result<(), EngineError> {
        let values = values_configmap_name(&self.name, self.runtime_type());
        for cm in [values, self.config_configmap_name()] {
            self.ctx.cluster.delete_configmap(&self.namespace, &cm).await?;
        }
        Ok(())
    }

    /// Remove the fuse label from every node. Returns how many nodes changed.
    pub async fn clean_fuse(&mut self) -> Result<usize, EngineError> {
        let label = self.runtime_info().await?.labels().fuse();
        let nodes = self
            .ctx
            .cluster
            .list_nodes(Some(&flag_selector(&label)))
            .await?;
        let mut cleaned = 0;
        for node in &nodes {
            if node_ledger::remove_label(
                self.ctx.cluster.as_ref(),
                &self.ctx.retry,
                node_name(node),
                &label,
            )
            .await?
            {
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }
}
