//! Typed views of the cache runtime and dataset custom resources.
//!
//! Only the fields the controller reads or writes are modelled; unknown
//! fields are ignored on the way in.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &str = "data.fluid.io";
pub const API_VERSION: &str = "v1alpha1";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRuntime {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RuntimeSpec,
    #[serde(default)]
    pub status: RuntimeStatus,
}

impl CacheRuntime {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Master replicas; an unset count means a single master.
    pub fn master_replicas(&self) -> i32 {
        if self.spec.master.replicas <= 0 {
            1
        } else {
            self.spec.master.replicas
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSpec {
    /// Desired worker count.
    pub replicas: i32,
    pub image: Option<String>,
    pub image_tag: Option<String>,
    pub master: MasterSpec,
    pub worker: WorkerSpec,
    pub fuse: FuseSpec,
    pub tieredstore: TieredStore,
    pub network_mode: NetworkMode,
    pub tolerations: Vec<Toleration>,
    pub properties: BTreeMap<String, String>,
    pub management: RuntimeManagement,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MasterSpec {
    pub replicas: i32,
    pub node_selector: BTreeMap<String, String>,
    pub resources: Option<ResourceRequirements>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSpec {
    pub node_selector: BTreeMap<String, String>,
    pub resources: Option<ResourceRequirements>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FuseSpec {
    /// Deploy fuse on every node matching `node_selector` instead of only on cache nodes.
    pub global: bool,
    pub node_selector: BTreeMap<String, String>,
    pub image: Option<String>,
    pub image_tag: Option<String>,
    pub resources: Option<ResourceRequirements>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeManagement {
    pub metadata_sync_policy: MetadataSyncPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataSyncPolicy {
    pub auto_sync: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    #[default]
    HostNetwork,
    ContainerNetwork,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredStore {
    pub levels: Vec<Level>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Level {
    #[serde(rename = "mediumtype")]
    pub medium_type: MediumType,
    pub volume_type: VolumeType,
    /// Comma separated list of directories.
    pub path: String,
    pub quota: Option<String>,
    pub high: Option<String>,
    pub low: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediumType {
    #[default]
    #[serde(rename = "MEM")]
    Memory,
    #[serde(rename = "SSD")]
    Ssd,
    #[serde(rename = "HDD")]
    Hdd,
}

impl MediumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediumType::Memory => "MEM",
            MediumType::Ssd => "SSD",
            MediumType::Hdd => "HDD",
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, MediumType::Memory)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeType {
    #[default]
    HostPath,
    EmptyDir,
}

/// Lifecycle phase of one runtime component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimePhase {
    #[default]
    #[serde(rename = "")]
    None,
    NotReady,
    PartialReady,
    Ready,
    Failed,
}

impl fmt::Display for RuntimePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimePhase::None => write!(f, "None"),
            RuntimePhase::NotReady => write!(f, "NotReady"),
            RuntimePhase::PartialReady => write!(f, "PartialReady"),
            RuntimePhase::Ready => write!(f, "Ready"),
            RuntimePhase::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheStateName {
    CacheCapacity,
    Cached,
    CachedPercentage,
}

pub type CacheStates = BTreeMap<CacheStateName, String>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeStatus {
    pub master_phase: RuntimePhase,
    pub worker_phase: RuntimePhase,
    pub fuse_phase: RuntimePhase,

    pub desired_master_number_scheduled: i32,
    pub current_master_number_scheduled: i32,
    pub master_number_ready: i32,

    pub desired_worker_number_scheduled: i32,
    pub current_worker_number_scheduled: i32,
    pub worker_number_ready: i32,
    pub worker_number_available: i32,

    pub desired_fuse_number_scheduled: i32,
    pub current_fuse_number_scheduled: i32,
    pub fuse_number_ready: i32,
    pub fuse_number_available: i32,

    pub cache_states: CacheStates,
    pub conditions: Vec<RuntimeCondition>,
    /// Name of the ConfigMap holding the rendered release values.
    pub value_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    MasterInitialized,
    MasterReady,
    WorkersInitialized,
    WorkersReady,
    FusesInitialized,
    FusesReady,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    #[default]
    True,
    False,
    Unknown,
}

pub mod reasons {
    pub const MASTER_INITIALIZED: &str = "Master is initialized";
    pub const MASTER_READY: &str = "Master is ready";
    pub const MASTER_NOT_READY: &str = "Master is not ready";
    pub const WORKERS_INITIALIZED: &str = "Workers are initialized";
    pub const WORKERS_READY: &str = "Workers are ready";
    pub const WORKERS_NOT_READY: &str = "Workers are not ready";
    pub const FUSES_INITIALIZED: &str = "Fuses are initialized";
    pub const FUSES_READY: &str = "Fuses are ready";
    pub const FUSES_NOT_READY: &str = "Fuses are not ready";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub last_update_time: String,
    #[serde(default)]
    pub last_transition_time: String,
}

impl RuntimeCondition {
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_update_time: now.clone(),
            last_transition_time: now,
        }
    }
}

/// Record a condition, keeping at most one entry per condition type.
///
/// New types are appended. An entry of an existing type is rewritten in place
/// only when its status, reason or message differs, so repeating the same
/// observation leaves the list untouched. The transition time survives
/// rewrites that do not flip the status.
pub fn set_condition(conditions: &mut Vec<RuntimeCondition>, cond: RuntimeCondition) {
    match conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        Some(existing) => {
            if existing.status == cond.status
                && existing.reason == cond.reason
                && existing.message == cond.message
            {
                return;
            }
            let transition = if existing.status == cond.status {
                existing.last_transition_time.clone()
            } else {
                cond.last_transition_time.clone()
            };
            *existing = RuntimeCondition {
                last_transition_time: transition,
                ..cond
            };
        }
        None => conditions.push(cond),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DatasetSpec,
    #[serde(default)]
    pub status: DatasetStatus,
}

impl Dataset {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatasetSpec {
    pub mounts: Vec<Mount>,
    pub placement: PlacementMode,
    /// Metadata backup to take the UFS totals from instead of scanning the under storage.
    pub data_restore_location: Option<DataRestoreLocation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Mount {
    pub name: String,
    /// Under storage URI, e.g. `s3://bucket/dir`, `pvc://claim/dir` or `local:///mnt/data`.
    pub mount_point: String,
}

impl Mount {
    /// Claims and host paths are mounted into the cache containers instead of
    /// being reached through an under storage client.
    pub fn is_native(&self) -> bool {
        self.mount_point.starts_with("pvc://") || self.mount_point.starts_with("local://")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataRestoreLocation {
    /// `pvc://<claim>/<dir>` or `local://<dir>`.
    pub path: String,
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementMode {
    #[default]
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetPhase {
    #[default]
    #[serde(rename = "")]
    None,
    Pending,
    NotBound,
    Bound,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatasetStatus {
    pub phase: DatasetPhase,
    /// Empty while unknown, the calculating sentinel while a sync runs, then final.
    pub ufs_total: String,
    pub file_num: String,
    pub cache_states: CacheStates,
}
