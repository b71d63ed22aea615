use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Node, Taint, Toleration};
use tracing::{debug, info};

use super::phase::{classify_phase, is_serving};
use super::{EngineError, RuntimeEngine};
use crate::api::{
    CacheRuntime, ConditionStatus, ConditionType, RuntimeCondition, RuntimePhase, reasons,
    set_condition,
};
use crate::labels::{DATASET_NUM, EXCLUSIVE};
use crate::node_ledger::{self, node_name};
use crate::runtime_info::RuntimeInfo;
use crate::units::parse_quantity;

/// Fuse replica counts: (desired, current, ready, available).
type FuseCounts = (i32, i32, i32, i32);

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn tolerates(tolerations: &[Toleration], taint: &Taint) -> bool {
    tolerations.iter().any(|t| {
        let effect_matches = t
            .effect
            .as_deref()
            .is_none_or(|e| e.is_empty() || e == taint.effect);
        let key_matches = match t.operator.as_deref() {
            Some("Exists") => t.key.as_deref().is_none_or(|k| k.is_empty() || k == taint.key),
            _ => t.key.as_deref() == Some(taint.key.as_str()) && t.value == taint.value,
        };
        effect_matches && key_matches
    })
}

/// A node whose taints would keep worker pods away.
fn is_tainted(node: &Node, tolerations: &[Toleration]) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| {
            taints.iter().any(|t| {
                (t.effect == "NoSchedule" || t.effect == "NoExecute") && !tolerates(tolerations, t)
            })
        })
        .unwrap_or(false)
}

fn matches_selector(node: &Node, selector: &BTreeMap<String, String>) -> bool {
    let labels = node.metadata.labels.as_ref();
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// Whether `node` may join the cache cohort of `info`.
fn can_be_assigned(node: &Node, info: &RuntimeInfo, memory_quota: Option<u64>) -> bool {
    let labels = node.metadata.labels.clone().unwrap_or_default();
    if labels.contains_key(EXCLUSIVE) {
        return false;
    }
    if info.is_exclusive() {
        let shared = labels
            .get(DATASET_NUM)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        if shared > 0 {
            return false;
        }
    }
    if let Some(required) = memory_quota.filter(|q| *q > 0) {
        let allocatable = node
            .status
            .as_ref()
            .and_then(|s| s.allocatable.as_ref())
            .and_then(|a| a.get("memory"))
            .and_then(|q| parse_quantity(&q.0).ok())
            .unwrap_or(0);
        if allocatable < required {
            debug!(node = %node_name(node), allocatable, required, "not enough memory for cache tier");
            return false;
        }
    }
    true
}

impl RuntimeEngine {
    /// True only while the workers have never been set up.
    pub fn should_setup_workers(runtime: &CacheRuntime) -> bool {
        runtime.status.worker_phase == RuntimePhase::None
    }

    /// The worker StatefulSet. A worker that only exists as a DaemonSet was
    /// created by an older release and surfaces as `Deprecated`.
    pub(crate) async fn worker_statefulset(&self) -> Result<StatefulSet, EngineError> {
        let worker = self.worker_name();
        match self.ctx.cluster.get_statefulset(&self.namespace, &worker).await {
            Ok(sts) => Ok(sts),
            Err(e) if e.is_not_found() => {
                match self.ctx.cluster.get_daemonset(&self.namespace, &worker).await {
                    Ok(_) => Err(EngineError::Deprecated(
                        format!("{}/{}", self.namespace, self.name),
                        "workers run as a DaemonSet".to_string(),
                    )),
                    Err(_) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fuse counts from the fuse DaemonSet, or zeros when it does not exist.
    async fn fuse_counts(&self) -> Result<Option<FuseCounts>, EngineError> {
        match self
            .ctx
            .cluster
            .get_daemonset(&self.namespace, &self.fuse_name())
            .await
        {
            Ok(ds) => {
                let s = ds.status.unwrap_or_default();
                Ok(Some((
                    s.desired_number_scheduled,
                    s.current_number_scheduled,
                    s.number_ready,
                    s.number_available.unwrap_or(0),
                )))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Label nodes until `desired` nodes carry this runtime. Returns the number
    /// of assigned nodes, which may fall short when too few nodes qualify.
    pub async fn assign_nodes_to_cache(&mut self, desired: i32) -> Result<i32, EngineError> {
        let info = self.runtime_info().await?;
        let runtime = self.get_runtime().await?;
        let cluster = self.ctx.cluster.clone();
        let _guard = self.ctx.node_lock.lock().await;

        let mut count = node_ledger::list_assigned_nodes(cluster.as_ref(), &info)
            .await?
            .len() as i32;
        if count >= desired {
            return Ok(count);
        }

        let memory_quota = if self.profile.tiered_store_aware {
            Some(info.tier_quota()?.memory)
        } else {
            None
        };
        let common = info.labels().common();
        let mut nodes = cluster.list_nodes(None).await?;
        nodes.sort_by(|a, b| node_name(a).cmp(node_name(b)));

        for node in &nodes {
            if count >= desired {
                break;
            }
            let name = node_name(node);
            let labels = node.metadata.labels.as_ref();
            if labels.is_some_and(|l| l.contains_key(&common)) {
                continue;
            }
            if !node_is_ready(node)
                || is_tainted(node, &runtime.spec.tolerations)
                || !matches_selector(node, &runtime.spec.worker.node_selector)
                || !can_be_assigned(node, &info, memory_quota)
            {
                debug!(node = %name, "node not eligible for cache");
                continue;
            }
            node_ledger::assign_node(cluster.as_ref(), &self.ctx.retry, name, &info).await?;
            count += 1;
        }
        info!(namespace = %self.namespace, runtime = %self.name, assigned = count, desired, "assigned nodes to cache");
        Ok(count)
    }

    /// Assign nodes, scale the worker StatefulSet to the desired count and record
    /// the initial worker and fuse status.
    pub async fn setup_workers(&mut self) -> Result<(), EngineError> {
        let runtime = self.get_runtime().await?;
        let desired = runtime.spec.replicas;
        self.worker_statefulset().await?;

        let assigned = self.assign_nodes_to_cache(desired).await?;
        self.scale_statefulset(&self.worker_name(), desired).await?;

        let fuse_global = self.runtime_info().await?.fuse().global;
        let fuse = if fuse_global {
            self.fuse_counts().await?.unwrap_or_default()
        } else {
            (assigned, assigned, 0, 0)
        };

        self.update_runtime_status(|rt| {
            let status = &mut rt.status;
            status.worker_phase = RuntimePhase::NotReady;
            status.desired_worker_number_scheduled = desired;
            status.current_worker_number_scheduled = assigned;
            status.fuse_phase = RuntimePhase::NotReady;
            status.desired_fuse_number_scheduled = fuse.0;
            status.current_fuse_number_scheduled = fuse.1;
            set_condition(
                &mut status.conditions,
                RuntimeCondition::new(
                    ConditionType::WorkersInitialized,
                    ConditionStatus::True,
                    reasons::WORKERS_INITIALIZED,
                    "The workers are initialized.",
                ),
            );
            set_condition(
                &mut status.conditions,
                RuntimeCondition::new(
                    ConditionType::FusesInitialized,
                    ConditionStatus::True,
                    reasons::FUSES_INITIALIZED,
                    "The fuses are initialized.",
                ),
            );
        })
        .await?;

        if desired > 0 && assigned == 0 {
            return Err(EngineError::NoSchedulableWorkers(format!(
                "{}/{}",
                self.namespace, self.name
            )));
        }
        Ok(())
    }

    /// Classify workers and fuse and record `WorkersReady`/`FusesReady`.
    /// Returns whether at least one worker is ready.
    pub async fn check_workers_ready(&mut self) -> Result<bool, EngineError> {
        let runtime = self.get_runtime().await?;
        let desired = runtime.spec.replicas;
        let sts_status = self.worker_statefulset().await?.status.unwrap_or_default();
        let ready = sts_status.ready_replicas.unwrap_or(0);
        let available = sts_status.available_replicas.unwrap_or(0);
        let worker_phase = classify_phase(desired, ready);

        let fuse = self.fuse_counts().await?;
        let fuse_phase = match fuse {
            Some((fuse_desired, _, fuse_ready, _)) => classify_phase(fuse_desired, fuse_ready),
            None => RuntimePhase::NotReady,
        };
        let workers_serving = is_serving(worker_phase);
        let fuses_serving = is_serving(fuse_phase);

        self.update_runtime_status(|rt| {
            let status = &mut rt.status;
            status.worker_phase = worker_phase;
            status.worker_number_ready = ready;
            status.worker_number_available = available;
            status.fuse_phase = fuse_phase;
            if let Some((fuse_desired, fuse_current, fuse_ready, fuse_available)) = fuse {
                status.desired_fuse_number_scheduled = fuse_desired;
                status.current_fuse_number_scheduled = fuse_current;
                status.fuse_number_ready = fuse_ready;
                status.fuse_number_available = fuse_available;
            }
            let workers = if workers_serving {
                RuntimeCondition::new(
                    ConditionType::WorkersReady,
                    ConditionStatus::True,
                    reasons::WORKERS_READY,
                    "The workers are ready.",
                )
            } else {
                RuntimeCondition::new(
                    ConditionType::WorkersReady,
                    ConditionStatus::False,
                    reasons::WORKERS_NOT_READY,
                    format!("{ready} of {desired} workers are ready."),
                )
            };
            set_condition(&mut status.conditions, workers);
            let fuses = if fuses_serving {
                RuntimeCondition::new(
                    ConditionType::FusesReady,
                    ConditionStatus::True,
                    reasons::FUSES_READY,
                    "The fuses are ready.",
                )
            } else {
                RuntimeCondition::new(
                    ConditionType::FusesReady,
                    ConditionStatus::False,
                    reasons::FUSES_NOT_READY,
                    "The fuses are not ready.",
                )
            };
            set_condition(&mut status.conditions, fuses);
        })
        .await?;
        Ok(workers_serving)
    }
}
