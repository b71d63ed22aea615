//! Abstraction over the Kubernetes API operations the controller needs.
//!
//! `ClusterBackend` is implemented by [`KubeBackend`] for real clusters and by
//! in-memory fakes in tests. Not-found and conflict are distinguishable on
//! every error so callers can branch on them.

mod kube_backend;

pub use kube_backend::KubeBackend;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};

use crate::api::{CacheRuntime, Dataset};
use crate::retry::ConflictError;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("conflict updating {kind} {name}: resourceVersion mismatch")]
    Conflict { kind: &'static str, name: String },
    #[error("backend error: {0}")]
    Backend(String),
    #[error("malformed object: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ClusterError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(kind: &'static str, name: impl Into<String>) -> Self {
        ClusterError::Conflict {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

impl ConflictError for ClusterError {
    fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }
}

/// Label changes for one node. A `None` value deletes the label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelPatch {
    pub labels: BTreeMap<String, Option<String>>,
    /// When set, the patch is rejected with a conflict unless the node is still at this version.
    pub resource_version: Option<String>,
}

impl LabelPatch {
    /// Strategic-merge body: `{"metadata":{"labels":{k: v|null}}}`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut metadata = serde_json::Map::new();
        metadata.insert("labels".to_string(), serde_json::json!(self.labels));
        if let Some(rv) = &self.resource_version {
            metadata.insert("resourceVersion".to_string(), serde_json::json!(rv));
        }
        serde_json::json!({ "metadata": metadata })
    }
}

/// Kubernetes API operations used by the lifecycle engine.
#[async_trait]
pub trait ClusterBackend: Send + Sync + 'static {
    // ========================================================================
    // Custom resources
    // ========================================================================

    async fn get_runtime(&self, namespace: &str, name: &str)
    -> Result<CacheRuntime, ClusterError>;

    /// List runtimes of the configured kind, optionally limited to one namespace.
    async fn list_runtimes(&self, namespace: Option<&str>)
    -> Result<Vec<CacheRuntime>, ClusterError>;

    /// Write the status subresource. Fails with a conflict on a stale resourceVersion.
    async fn update_runtime_status(
        &self,
        runtime: CacheRuntime,
    ) -> Result<CacheRuntime, ClusterError>;

    /// Write `metadata.finalizers`. Fails with a conflict on a stale resourceVersion.
    ///
    /// Dropping the last finalizer of a runtime that is being deleted lets the
    /// API server remove it.
    async fn update_runtime_finalizers(
        &self,
        runtime: CacheRuntime,
    ) -> Result<CacheRuntime, ClusterError>;

    async fn get_dataset(&self, namespace: &str, name: &str) -> Result<Dataset, ClusterError>;

    /// Write the status subresource. Fails with a conflict on a stale resourceVersion.
    async fn update_dataset_status(&self, dataset: Dataset) -> Result<Dataset, ClusterError>;

    // ========================================================================
    // Nodes
    // ========================================================================

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;

    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>, ClusterError>;

    async fn patch_node_labels(&self, name: &str, patch: LabelPatch)
    -> Result<Node, ClusterError>;

    // ========================================================================
    // Workloads
    // ========================================================================

    async fn get_statefulset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<StatefulSet, ClusterError>;

    /// Replace using CAS semantics on the object's resourceVersion.
    async fn replace_statefulset(&self, statefulset: StatefulSet)
    -> Result<StatefulSet, ClusterError>;

    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<DaemonSet, ClusterError>;

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, ClusterError>;

    // ========================================================================
    // ConfigMaps
    // ========================================================================

    /// Returns None if the ConfigMap doesn't exist.
    async fn get_configmap(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClusterError>;

    /// Create or overwrite the ConfigMap's data.
    async fn apply_configmap(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<ConfigMap, ClusterError>;

    /// Not finding the ConfigMap is not an error (idempotent).
    async fn delete_configmap(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}
