use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::{Node, Pod};
use tracing::{info, warn};

use super::{EngineError, RuntimeEngine};
use crate::node_ledger::{self, node_name};

/// Addresses the cache engine may report a worker under.
fn node_addresses(node: &Node) -> Vec<&str> {
    let mut addrs: Vec<&str> = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|addrs| {
            addrs
                .iter()
                .filter(|a| a.type_ == "InternalIP" || a.type_ == "Hostname")
                .map(|a| a.address.as_str())
                .collect()
        })
        .unwrap_or_default();
    addrs.push(node_name(node));
    addrs
}

fn used_bytes(node: &Node, usage: &BTreeMap<String, u64>) -> u64 {
    node_addresses(node)
        .iter()
        .find_map(|a| usage.get(*a).copied())
        .unwrap_or(0)
}

/// Order scale-in candidates: least cached data first, then by name.
fn order_by_usage(nodes: &mut [Node], usage: &BTreeMap<String, u64>) {
    nodes.sort_by(|a, b| match used_bytes(a, usage).cmp(&used_bytes(b, usage)) {
        Ordering::Equal => node_name(a).cmp(node_name(b)),
        other => other,
    });
}

/// Finished or terminating pods no longer hold their volumes.
fn holds_volumes(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    !matches!(phase, Some("Succeeded" | "Failed"))
}

impl RuntimeEngine {
    /// Nodes running a pod that mounts this runtime's dataset volume.
    async fn nodes_with_mounted_volume(&self) -> Result<HashSet<String>, EngineError> {
        let pods = self.ctx.cluster.list_pods(&self.namespace).await?;
        let nodes = pods
            .into_iter()
            .filter(holds_volumes)
            .filter_map(|pod| {
                let spec = pod.spec?;
                let mounts_dataset = spec.volumes.unwrap_or_default().iter().any(|v| {
                    v.persistent_volume_claim
                        .as_ref()
                        .is_some_and(|pvc| pvc.claim_name == self.name)
                });
                if mounts_dataset { spec.node_name } else { None }
            })
            .collect();
        Ok(nodes)
    }

    /// Remove cache nodes until `expected` remain, or all of them for a negative
    /// `expected`. Returns how many nodes are still assigned.
    ///
    /// Nodes with a mounted dataset volume are kept, and among the rest the ones
    /// holding the least cached data go first.
    pub async fn destroy_workers(&mut self, expected: i32) -> Result<i32, EngineError> {
        let info = self.runtime_info().await?;
        let cluster = self.ctx.cluster.clone();
        let _guard = self.ctx.node_lock.lock().await;

        let assigned = node_ledger::list_assigned_nodes(cluster.as_ref(), &info).await?;
        let mut current = assigned.len() as i32;
        if expected >= 0 && current <= expected {
            return Ok(current);
        }

        let mut candidates = assigned;
        if expected >= 0 {
            if self.profile.mount_aware_scale_in && !info.fuse().global {
                let in_use = self.nodes_with_mounted_volume().await?;
                candidates.retain(|n| !in_use.contains(node_name(n)));
            }
            match self.file_utils().report_capacity().await {
                Ok(usage) => order_by_usage(&mut candidates, &usage),
                Err(e) => {
                    warn!(namespace = %self.namespace, runtime = %self.name, error = %e, "cannot read worker usage, scaling in by name");
                }
            }
        }

        for node in &candidates {
            if expected >= 0 && current <= expected {
                break;
            }
            let name = node_name(node);
            node_ledger::unassign_node(cluster.as_ref(), &self.ctx.retry, name, &info).await?;
            current -= 1;
            if let Some(metrics) = &self.ctx.metrics {
                metrics.record_worker_scaled_in(&self.namespace, &self.name);
            }
        }
        if expected >= 0 && current > expected {
            warn!(namespace = %self.namespace, runtime = %self.name, current, expected, "remaining nodes are in use, cannot scale in further");
        }
        Ok(current)
    }

    /// Bring the cache node count in line with `spec.replicas`.
    pub async fn sync_replicas(&mut self) -> Result<(), EngineError> {
        let result = self.sync_replicas_inner().await;
        match result {
            Err(e) if e.is_deprecated() => {
                warn!(namespace = %self.namespace, runtime = %self.name, error = %e, "skipping replica sync");
                Ok(())
            }
            other => other,
        }
    }

    async fn sync_replicas_inner(&mut self) -> Result<(), EngineError> {
        let runtime = self.get_runtime().await?;
        let desired = runtime.spec.replicas;
        let current = runtime.status.current_worker_number_scheduled;

        match desired.cmp(&current) {
            Ordering::Equal => Ok(()),
            Ordering::Greater => {
                info!(namespace = %self.namespace, runtime = %self.name, current, desired, "scaling out workers");
                self.setup_workers().await?;
                self.check_workers_ready().await?;
                Ok(())
            }
            Ordering::Less => {
                info!(namespace = %self.namespace, runtime = %self.name, current, desired, "scaling in workers");
                self.worker_statefulset().await?;
                let remaining = self.destroy_workers(desired).await?;
                self.scale_statefulset(&self.worker_name(), remaining).await?;
                self.update_runtime_status(|rt| {
                    rt.status.desired_worker_number_scheduled = desired;
                    rt.status.current_worker_number_scheduled = remaining;
                    if !rt.spec.fuse.global {
                        rt.status.desired_fuse_number_scheduled = remaining;
                        rt.status.current_fuse_number_scheduled = remaining;
                    }
                })
                .await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn pod(phase: &str, deleting: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                deletion_timestamp: deleting.then(|| Time(chrono::Utc::now())),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn only_live_pods_hold_volumes() {
        assert!(holds_volumes(&pod("Running", false)));
        assert!(holds_volumes(&pod("Pending", false)));
        assert!(holds_volumes(&Pod::default()));
        assert!(!holds_volumes(&pod("Succeeded", false)));
        assert!(!holds_volumes(&pod("Failed", false)));
        assert!(!holds_volumes(&pod("Running", true)));
    }

    fn node(name: &str, ip: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".into(),
                    address: ip.into(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn least_used_nodes_come_first() {
        let mut nodes = vec![
            node("a", "10.0.0.1"),
            node("b", "10.0.0.2"),
            node("c", "10.0.0.3"),
        ];
        let usage = BTreeMap::from([
            ("10.0.0.1".to_string(), 300),
            ("10.0.0.2".to_string(), 100),
        ]);
        order_by_usage(&mut nodes, &usage);
        let names: Vec<_> = nodes.iter().map(node_name).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }

    #[test]
    fn ties_break_by_name() {
        let mut nodes = vec![node("z", "10.0.0.9"), node("m", "10.0.0.8")];
        order_by_usage(&mut nodes, &BTreeMap::new());
        assert_eq!(node_name(&nodes[0]), "m");
    }
}
