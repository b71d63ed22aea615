//! Node label ledger.
//!
//! Which nodes belong to a runtime is recorded only as labels on the nodes
//! themselves. Every change is computed as a [`LabelDelta`] against a freshly
//! fetched node and sent as a patch guarded by that node's resourceVersion, so
//! concurrent writers never silently overwrite each other.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info};

use crate::cluster::{ClusterBackend, ClusterError, LabelPatch};
use crate::labels::{self, CapacityTier, DATASET_NUM, EXCLUSIVE};
use crate::retry::{ConflictError, RetryPolicy, backoff};
use crate::runtime_info::RuntimeInfo;
use crate::units::{UnitsError, bytes_size};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("invalid tier quota: {0}")]
    Quota(#[from] UnitsError),
}

/// Labels to set and labels to delete on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDelta {
    pub set: BTreeMap<String, String>,
    pub delete: Vec<String>,
}

impl LabelDelta {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.delete.is_empty()
    }

    /// Record `key=value`, skipping it when the node already carries it.
    fn set_if_changed(&mut self, current: &BTreeMap<String, String>, key: String, value: String) {
        if current.get(&key) != Some(&value) {
            self.set.insert(key, value);
        }
    }

    /// Record deletion of `key`, skipping it when the node does not carry it.
    fn delete_if_present(&mut self, current: &BTreeMap<String, String>, key: String) {
        if current.contains_key(&key) {
            self.delete.push(key);
        }
    }

    fn put(&mut self, key: &str, value: String) {
        self.set.insert(key.to_string(), value);
    }

    /// Apply the delta to a label map.
    pub fn apply_to(&self, labels: &mut BTreeMap<String, String>) {
        for key in &self.delete {
            labels.remove(key);
        }
        for (k, v) in &self.set {
            labels.insert(k.clone(), v.clone());
        }
    }

    pub fn to_patch(&self, resource_version: Option<String>) -> LabelPatch {
        let mut labels: BTreeMap<String, Option<String>> =
            self.delete.iter().map(|k| (k.clone(), None)).collect();
        for (k, v) in &self.set {
            labels.insert(k.clone(), Some(v.clone()));
        }
        LabelPatch {
            labels,
            resource_version,
        }
    }
}

fn node_labels(node: &Node) -> BTreeMap<String, String> {
    node.metadata.labels.clone().unwrap_or_default()
}

pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

fn dataset_num(labels: &BTreeMap<String, String>) -> u32 {
    labels
        .get(DATASET_NUM)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Delta that assigns `node` to the runtime. Empty if the node is already assigned.
pub fn assign_delta(node: &Node, info: &RuntimeInfo) -> Result<LabelDelta, UnitsError> {
    let current = node_labels(node);
    let names = info.labels();
    let mut delta = LabelDelta::default();
    if current.contains_key(&names.common()) {
        return Ok(delta);
    }
    delta.set_if_changed(&current, names.runtime(), "true".to_string());
    delta.set_if_changed(&current, names.common(), "true".to_string());

    let quota = info.tier_quota()?;
    let capacity = [
        (CapacityTier::Memory, quota.memory),
        (CapacityTier::Disk, quota.disk),
        (CapacityTier::Total, quota.total()),
    ];
    for (tier, bytes) in capacity {
        if bytes > 0 {
            delta.set_if_changed(&current, names.capacity(tier), bytes_size(bytes as f64));
        }
    }
    if info.is_exclusive() {
        delta.set_if_changed(&current, EXCLUSIVE.to_string(), names.exclusive_value());
    }
    delta.put(DATASET_NUM, (dataset_num(&current) + 1).to_string());
    Ok(delta)
}

/// Delta that removes the runtime from `node`. Empty if nothing of the runtime is left.
pub fn unassign_delta(node: &Node, info: &RuntimeInfo) -> LabelDelta {
    let current = node_labels(node);
    let names = info.labels();
    let mut delta = LabelDelta::default();
    let assigned = current.contains_key(&names.common());
    for key in names.owned() {
        delta.delete_if_present(&current, key);
    }
    if current.get(EXCLUSIVE) == Some(&names.exclusive_value()) {
        delta.delete.push(EXCLUSIVE.to_string());
    }
    if assigned {
        match dataset_num(&current) {
            0 | 1 => delta.delete_if_present(&current, DATASET_NUM.to_string()),
            n => delta.put(DATASET_NUM, (n - 1).to_string()),
        }
    }
    delta
}

/// Fetch the node, compute a delta from its current labels and patch it,
/// retrying from a fresh read on conflict. Returns the delta that was applied.
async fn patch_with<F>(
    cluster: &dyn ClusterBackend,
    policy: &RetryPolicy,
    node: &str,
    mut compute: F,
) -> Result<LabelDelta, LedgerError>
where
    F: FnMut(&Node) -> Result<LabelDelta, LedgerError>,
{
    let mut failures = 0;
    loop {
        let attempt: Result<LabelDelta, LedgerError> = async {
            let fresh = cluster.get_node(node).await?;
            let delta = compute(&fresh)?;
            if delta.is_empty() {
                return Ok(delta);
            }
            let rv = fresh.metadata.resource_version.clone();
            cluster.patch_node_labels(node, delta.to_patch(rv)).await?;
            Ok(delta)
        }
        .await;
        match attempt {
            Err(e) if e.is_conflict() => backoff(policy, &mut failures, e).await?,
            other => return other,
        }
    }
}

impl ConflictError for LedgerError {
    fn is_conflict(&self) -> bool {
        match self {
            LedgerError::Cluster(e) => e.is_conflict(),
            LedgerError::Quota(_) => false,
        }
    }
}

/// Label `node` as a cache node of the runtime. Idempotent: assigning twice leaves
/// the node and the dataset counter unchanged.
pub async fn assign_node(
    cluster: &dyn ClusterBackend,
    policy: &RetryPolicy,
    node: &str,
    info: &RuntimeInfo,
) -> Result<LabelDelta, LedgerError> {
    let delta = patch_with(cluster, policy, node, |n| Ok(assign_delta(n, info)?)).await?;
    if !delta.is_empty() {
        info!(node = %node, runtime = %info.name(), namespace = %info.namespace(), "assigned node to cache");
    }
    Ok(delta)
}

/// Remove every label of the runtime from `node`. Idempotent.
pub async fn unassign_node(
    cluster: &dyn ClusterBackend,
    policy: &RetryPolicy,
    node: &str,
    info: &RuntimeInfo,
) -> Result<LabelDelta, LedgerError> {
    let delta = patch_with(cluster, policy, node, |n| Ok(unassign_delta(n, info))).await?;
    if !delta.is_empty() {
        info!(node = %node, runtime = %info.name(), namespace = %info.namespace(), "removed node from cache");
    }
    Ok(delta)
}

/// Remove a single flag label such as the fuse label. Idempotent.
pub async fn remove_label(
    cluster: &dyn ClusterBackend,
    policy: &RetryPolicy,
    node: &str,
    label: &str,
) -> Result<bool, LedgerError> {
    let delta = patch_with(cluster, policy, node, |n| {
        let mut delta = LabelDelta::default();
        delta.delete_if_present(&node_labels(n), label.to_string());
        Ok(delta)
    })
    .await?;
    debug!(node = %node, label = %label, removed = !delta.is_empty(), "remove node label");
    Ok(!delta.is_empty())
}

/// Nodes currently carrying the runtime's common label, sorted by name.
pub async fn list_assigned_nodes(
    cluster: &dyn ClusterBackend,
    info: &RuntimeInfo,
) -> Result<Vec<Node>, ClusterError> {
    let selector = labels::flag_selector(&info.labels().common());
    let mut nodes = cluster.list_nodes(Some(&selector)).await?;
    nodes.sort_by(|a, b| node_name(a).cmp(node_name(b)));
    Ok(nodes)
}

/// Whether any node still carries the legacy label of this runtime.
pub async fn uses_deprecated_labels(
    cluster: &dyn ClusterBackend,
    namespace: &str,
    name: &str,
) -> Result<bool, ClusterError> {
    let selector = labels::flag_selector(&labels::deprecated_common(namespace, name));
    Ok(!cluster.list_nodes(Some(&selector)).await?.is_empty())
}
