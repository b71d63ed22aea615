//! Per-runtime lifecycle engine.
//!
//! One [`RuntimeEngine`] exists per runtime identity and is driven by the
//! controller one pass at a time. Engines share the collaborators in
//! [`EngineContext`]; the only in-process coordination between them is the
//! port allocator and the [`NodeLabelLock`].

mod finalizer;
mod health;
mod master;
mod metadata;
mod phase;
mod reconcile;
mod replicas;
mod shutdown;
mod status;
mod transform;
mod worker;

pub use finalizer::finalizer_name;
pub use metadata::{CALCULATING, MetadataSyncResult};
pub use phase::classify_phase;
pub use reconcile::ReconcileOutcome;
pub use transform::{AllocatedPorts, RuntimeValues};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::api::{CacheRuntime, Dataset};
use crate::cluster::{ClusterBackend, ClusterError};
use crate::exec::{ExecError, RemoteExec};
use crate::helm::{ReleaseError, ReleaseManager};
use crate::inflight::InFlight;
use crate::metrics::Metrics;
use crate::node_ledger::{self, LedgerError};
use crate::operations::{CacheFileUtils, OperationError};
use crate::port_allocator::{PortAllocError, PortAllocator};
use crate::port_parser::PortParseError;
use crate::retry::{RetryPolicy, update_with_retry};
use crate::runtime_info::RuntimeInfo;
use crate::settings::{AppConfig, ImageConfig};
use crate::units::UnitsError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Release(#[from] ReleaseError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Ports(#[from] PortAllocError),
    #[error(transparent)]
    PortParse(#[from] PortParseError),
    #[error(transparent)]
    Units(#[from] UnitsError),
    #[error("failed to render release values: {0}")]
    Values(#[from] serde_yaml::Error),
    #[error("failed to write release values: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime {0} uses a deprecated layout: {1}")]
    Deprecated(String, String),
    #[error("invalid runtime spec: {0}")]
    InvalidSpec(String),
    #[error("no node can be assigned to runtime {0}")]
    NoSchedulableWorkers(String),
    #[error("{component} of runtime {runtime} is not healthy: {reason}")]
    Unhealthy {
        component: &'static str,
        runtime: String,
        reason: String,
    },
    #[error("cache of runtime {runtime} still holds {cached}")]
    CacheNotCleaned { runtime: String, cached: String },
    #[error("metadata sync of {0} failed: {1}")]
    MetadataSync(String, String),
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Cluster(e) => EngineError::Cluster(e),
            LedgerError::Quota(e) => EngineError::Units(e),
        }
    }
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Cluster(e) if e.is_not_found())
    }

    pub fn is_deprecated(&self) -> bool {
        matches!(self, EngineError::Deprecated(..))
    }
}

/// Serializes node label mutations across every runtime in the process.
///
/// Scale-in and node assignment read and rewrite the shared `dataset-num`
/// counter on nodes that may host several datasets, so this lock is
/// cluster-wide rather than per runtime. Clone it into every engine.
#[derive(Clone, Default)]
pub struct NodeLabelLock(Arc<Mutex<()>>);

impl NodeLabelLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

/// Behavioral switches between the legacy and hardened engine variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineProfile {
    /// Check node allocatable memory against the memory tier before assigning.
    pub tiered_store_aware: bool,
    /// Detect and keep using label names written by older releases.
    pub deprecated_label_support: bool,
    /// Skip nodes with mounted dataset volumes during scale-in.
    pub mount_aware_scale_in: bool,
    /// Master replica count that enables the raft journal.
    pub ha_master_replicas: i32,
}

impl EngineProfile {
    pub fn hardened() -> Self {
        Self {
            tiered_store_aware: true,
            deprecated_label_support: true,
            mount_aware_scale_in: true,
            ha_master_replicas: 3,
        }
    }

    pub fn legacy() -> Self {
        Self {
            tiered_store_aware: false,
            deprecated_label_support: false,
            mount_aware_scale_in: false,
            ha_master_replicas: 3,
        }
    }
}

impl Default for EngineProfile {
    fn default() -> Self {
        Self::hardened()
    }
}

/// Settings the engine reads on every pass.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub runtime_type: String,
    pub chart: String,
    pub values_dir: PathBuf,
    pub graceful_shutdown_limits: u32,
    pub metadata_poll_timeout: Duration,
    pub exec_timeout: Duration,
    pub query_ufs_total: bool,
    pub auto_sync: bool,
    pub image: ImageConfig,
}

impl EngineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            runtime_type: cfg.controller.runtime_type.clone(),
            chart: cfg.controller.chart.clone(),
            values_dir: cfg.controller.values_dir.clone(),
            graceful_shutdown_limits: cfg.controller.graceful_shutdown_limits,
            metadata_poll_timeout: Duration::from_millis(cfg.metadata.poll_timeout_ms),
            exec_timeout: Duration::from_secs(cfg.metadata.exec_timeout_secs),
            query_ufs_total: cfg.metadata.query_ufs_total,
            auto_sync: cfg.metadata.auto_sync,
            image: cfg.image.clone(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Collaborators shared by all engines of the process.
#[derive(Clone)]
pub struct EngineContext {
    pub cluster: Arc<dyn ClusterBackend>,
    pub releases: Arc<dyn ReleaseManager>,
    pub exec: Arc<dyn RemoteExec>,
    pub ports: Arc<PortAllocator>,
    pub node_lock: NodeLabelLock,
    pub settings: EngineSettings,
    pub retry: RetryPolicy,
    pub metrics: Option<Metrics>,
}

pub struct RuntimeEngine {
    ctx: EngineContext,
    profile: EngineProfile,
    namespace: String,
    name: String,
    runtime_info: Option<RuntimeInfo>,
    metadata_job: InFlight<MetadataSyncResult>,
    retry_shutdown: u32,
}

impl RuntimeEngine {
    pub fn new(
        ctx: EngineContext,
        profile: EngineProfile,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            profile,
            namespace: namespace.into(),
            name: name.into(),
            runtime_info: None,
            metadata_job: InFlight::new(),
            retry_shutdown: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn profile(&self) -> &EngineProfile {
        &self.profile
    }

    /// Failed cache cleanups recorded by [`RuntimeEngine::shutdown`].
    pub fn shutdown_attempts(&self) -> u32 {
        self.retry_shutdown
    }

    pub fn is_metadata_sync_pending(&self) -> bool {
        self.metadata_job.is_pending()
    }

    fn runtime_type(&self) -> &str {
        &self.ctx.settings.runtime_type
    }

    pub(crate) fn master_name(&self) -> String {
        format!("{}-master", self.name)
    }

    pub(crate) fn worker_name(&self) -> String {
        format!("{}-worker", self.name)
    }

    pub(crate) fn fuse_name(&self) -> String {
        format!("{}-fuse", self.name)
    }

    pub(crate) fn config_configmap_name(&self) -> String {
        format!("{}-config", self.name)
    }

    fn file_utils(&self) -> CacheFileUtils {
        CacheFileUtils::new(
            self.ctx.exec.clone(),
            &self.namespace,
            format!("{}-0", self.master_name()),
            format!("{}-master", self.runtime_type()),
            self.runtime_type(),
            self.ctx.settings.exec_timeout,
        )
    }

    pub(crate) async fn get_runtime(&self) -> Result<CacheRuntime, EngineError> {
        Ok(self.ctx.cluster.get_runtime(&self.namespace, &self.name).await?)
    }

    /// The bound dataset, or None if it does not exist (yet or anymore).
    pub(crate) async fn get_dataset(&self) -> Result<Option<Dataset>, EngineError> {
        match self.ctx.cluster.get_dataset(&self.namespace, &self.name).await {
            Ok(ds) => Ok(Some(ds)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rebuild the cached runtime view for this pass.
    ///
    /// When the runtime object is already gone the previous view is kept, so
    /// teardown still knows which labels and ports belong to the runtime.
    pub async fn refresh_runtime_info(&mut self) -> Result<&RuntimeInfo, EngineError> {
        let runtime = match self.get_runtime().await {
            Ok(rt) => Some(rt),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let info = match runtime {
            Some(runtime) => {
                let dataset = self.get_dataset().await?;
                let deprecated = if self.profile.deprecated_label_support {
                    node_ledger::uses_deprecated_labels(
                        self.ctx.cluster.as_ref(),
                        &self.namespace,
                        &self.name,
                    )
                    .await?
                } else {
                    false
                };
                RuntimeInfo::from_runtime(&runtime, dataset.as_ref(), self.runtime_type())
                    .with_deprecated_node_labels(deprecated)
            }
            None => match self.runtime_info.take() {
                Some(info) => info,
                None => RuntimeInfo::new(&self.name, &self.namespace, self.runtime_type()),
            },
        };
        debug!(namespace = %self.namespace, runtime = %self.name, deprecated = info.is_deprecated_node_labels(), "refreshed runtime info");
        Ok(self.runtime_info.insert(info))
    }

    /// The view built by the last [`refresh_runtime_info`](Self::refresh_runtime_info).
    pub(crate) async fn runtime_info(&mut self) -> Result<RuntimeInfo, EngineError> {
        match &self.runtime_info {
            Some(info) => Ok(info.clone()),
            None => Ok(self.refresh_runtime_info().await?.clone()),
        }
    }

    /// Read-modify-write the runtime status with conflict retries.
    pub(crate) async fn update_runtime_status<M>(&self, mutate: M) -> Result<CacheRuntime, EngineError>
    where
        M: FnMut(&mut CacheRuntime),
    {
        let cluster = self.ctx.cluster.as_ref();
        let (namespace, name) = (self.namespace.as_str(), self.name.as_str());
        let outcome = update_with_retry(
            &self.ctx.retry,
            || cluster.get_runtime(namespace, name),
            mutate,
            |runtime| cluster.update_runtime_status(runtime),
        )
        .await?;
        Ok(outcome.into_inner())
    }

    /// Read-modify-write the dataset status with conflict retries.
    /// Returns None when the dataset does not exist.
    pub(crate) async fn update_dataset_status<M>(
        &self,
        mutate: M,
    ) -> Result<Option<Dataset>, EngineError>
    where
        M: FnMut(&mut Dataset),
    {
        let cluster = self.ctx.cluster.as_ref();
        let (namespace, name) = (self.namespace.as_str(), self.name.as_str());
        let result = update_with_retry(
            &self.ctx.retry,
            || cluster.get_dataset(namespace, name),
            mutate,
            |dataset| cluster.update_dataset_status(dataset),
        )
        .await;
        match result {
            Ok(outcome) => Ok(Some(outcome.into_inner())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set the replica count of a StatefulSet, writing only when it differs.
    pub(crate) async fn scale_statefulset(
        &self,
        name: &str,
        replicas: i32,
    ) -> Result<StatefulSet, EngineError> {
        let cluster = self.ctx.cluster.as_ref();
        let namespace = self.namespace.as_str();
        let outcome = update_with_retry(
            &self.ctx.retry,
            || cluster.get_statefulset(namespace, name),
            |sts: &mut StatefulSet| {
                sts.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
            },
            |sts| cluster.replace_statefulset(sts),
        )
        .await?;
        if outcome.is_updated() {
            debug!(namespace = %namespace, statefulset = %name, replicas, "scaled statefulset");
        }
        Ok(outcome.into_inner())
    }

    fn record_step<T>(&self, step: &str, result: &Result<T, EngineError>) {
        if let Some(metrics) = &self.ctx.metrics {
            metrics.record_reconcile(step, result.is_ok());
        }
    }
}
