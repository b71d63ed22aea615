use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use serde::de::DeserializeOwned;

use super::{ClusterBackend, ClusterError, LabelPatch};
use crate::api::{API_GROUP, API_VERSION, CacheRuntime, Dataset};

const FIELD_MANAGER: &str = "ddc-controller";

fn map_kube_err(kind: &'static str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(e) if e.code == 404 => ClusterError::not_found(kind, name),
        kube::Error::Api(e) if e.code == 409 => ClusterError::conflict(kind, name),
        e => ClusterError::Backend(e.to_string()),
    }
}

fn custom_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: API_GROUP.to_string(),
        version: API_VERSION.to_string(),
        api_version: format!("{API_GROUP}/{API_VERSION}"),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// `alluxio` -> `AlluxioRuntime` / `alluxioruntimes`.
fn runtime_resource(runtime_type: &str) -> ApiResource {
    let mut chars = runtime_type.chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => String::new(),
    };
    custom_resource(
        &format!("{capitalized}Runtime"),
        &format!("{}runtimes", runtime_type.to_lowercase()),
    )
}

fn from_dynamic<T: DeserializeOwned>(obj: DynamicObject) -> Result<T, ClusterError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Status write body guarded by the object's resourceVersion.
fn status_patch<T: serde::Serialize>(
    resource_version: Option<&str>,
    status: &T,
) -> Result<serde_json::Value, ClusterError> {
    Ok(serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "status": serde_json::to_value(status)?,
    }))
}

/// Real Kubernetes backend using kube-rs client.
#[derive(Clone)]
pub struct KubeBackend {
    client: kube::Client,
    runtime_resource: ApiResource,
    dataset_resource: ApiResource,
}

impl KubeBackend {
    /// Create a backend for runtimes of `runtime_type` (e.g. `alluxio`).
    pub fn new(client: kube::Client, runtime_type: &str) -> Self {
        Self {
            client,
            runtime_resource: runtime_resource(runtime_type),
            dataset_resource: custom_resource("Dataset", "datasets"),
        }
    }

    fn runtimes(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.runtime_resource)
    }

    fn datasets(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.dataset_resource)
    }
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    async fn get_runtime(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<CacheRuntime, ClusterError> {
        let obj = self
            .runtimes(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_err("runtime", name, e))?;
        from_dynamic(obj)
    }

    async fn list_runtimes(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<CacheRuntime>, ClusterError> {
        let api = match namespace {
            Some(ns) => self.runtimes(ns),
            None => Api::all_with(self.client.clone(), &self.runtime_resource),
        };
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::Backend(e.to_string()))?;
        list.items.into_iter().map(from_dynamic).collect()
    }

    async fn update_runtime_status(
        &self,
        runtime: CacheRuntime,
    ) -> Result<CacheRuntime, ClusterError> {
        let body = status_patch(runtime.metadata.resource_version.as_deref(), &runtime.status)?;
        let obj = self
            .runtimes(runtime.namespace())
            .patch_status(runtime.name(), &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_kube_err("runtime", runtime.name(), e))?;
        from_dynamic(obj)
    }

    async fn update_runtime_finalizers(
        &self,
        runtime: CacheRuntime,
    ) -> Result<CacheRuntime, ClusterError> {
        // A merge patch replaces the whole list; the resourceVersion makes it a CAS.
        let body = serde_json::json!({
            "metadata": {
                "resourceVersion": runtime.metadata.resource_version,
                "finalizers": runtime.metadata.finalizers.clone().unwrap_or_default(),
            }
        });
        let obj = self
            .runtimes(runtime.namespace())
            .patch(runtime.name(), &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_kube_err("runtime", runtime.name(), e))?;
        from_dynamic(obj)
    }

    async fn get_dataset(&self, namespace: &str, name: &str) -> Result<Dataset, ClusterError> {
        let obj = self
            .datasets(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_err("dataset", name, e))?;
        from_dynamic(obj)
    }

    async fn update_dataset_status(&self, dataset: Dataset) -> Result<Dataset, ClusterError> {
        let body = status_patch(dataset.metadata.resource_version.as_deref(), &dataset.status)?;
        let obj = self
            .datasets(dataset.namespace())
            .patch_status(dataset.name(), &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_kube_err("dataset", dataset.name(), e))?;
        from_dynamic(obj)
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .get(name)
            .await
            .map_err(|e| map_kube_err("node", name, e))
    }

    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        let list = nodes
            .list(&lp)
            .await
            .map_err(|e| ClusterError::Backend(e.to_string()))?;
        Ok(list.items)
    }

    async fn patch_node_labels(&self, name: &str, patch: LabelPatch) -> Result<Node, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Strategic(patch.to_json()),
            )
            .await
            .map_err(|e| map_kube_err("node", name, e))
    }

    async fn get_statefulset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<StatefulSet, ClusterError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| map_kube_err("statefulset", name, e))
    }

    async fn replace_statefulset(
        &self,
        statefulset: StatefulSet,
    ) -> Result<StatefulSet, ClusterError> {
        let namespace = statefulset.metadata.namespace.clone().unwrap_or_default();
        let name = statefulset.metadata.name.clone().unwrap_or_default();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), &statefulset)
            .await
            .map_err(|e| map_kube_err("statefulset", &name, e))
    }

    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<DaemonSet, ClusterError> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| map_kube_err("daemonset", name, e))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::Backend(e.to_string()))?;
        Ok(list.items)
    }

    async fn get_configmap(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClusterError> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match configmaps.get(name).await {
            Ok(cm) => Ok(Some(cm)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(ClusterError::Backend(e.to_string())),
        }
    }

    async fn apply_configmap(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<ConfigMap, ClusterError> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": namespace },
            "data": data,
        });
        configmaps
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&body),
            )
            .await
            .map_err(|e| map_kube_err("configmap", name, e))
    }

    async fn delete_configmap(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match configmaps.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()), // Already deleted
            Err(e) => Err(ClusterError::Backend(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_runtime_resource_names() {
        let ar = runtime_resource("alluxio");
        assert_eq!(ar.kind, "AlluxioRuntime");
        assert_eq!(ar.plural, "alluxioruntimes");
        assert_eq!(ar.api_version, "data.fluid.io/v1alpha1");
    }
}
