//! Rendering release values from the runtime spec.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use serde::Serialize;

use super::{EngineError, EngineProfile, EngineSettings};
use crate::api::{CacheRuntime, NetworkMode, VolumeType};
use crate::port_allocator::PortAllocator;
use crate::runtime_info::RuntimeInfo;

const DEFAULT_MASTER_RPC_PORT: u16 = 19998;
const DEFAULT_WORKER_RPC_PORT: u16 = 29999;
const DEFAULT_JOURNAL_PORT: u16 = 19200;

const DEFAULT_IMAGE: &str = "alluxio/alluxio";
const DEFAULT_IMAGE_TAG: &str = "2.9.0";
const DEFAULT_FUSE_IMAGE: &str = "alluxio/alluxio-fuse";

/// Ports assigned to one runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedPorts {
    pub master_rpc: u16,
    pub worker_rpc: u16,
    /// Only present for an HA master.
    pub journal: Option<u16>,
    /// Whether the ports came from the allocator and must be released on teardown.
    pub reserved: bool,
}

impl AllocatedPorts {
    pub fn to_vec(&self) -> Vec<u16> {
        let mut ports = vec![self.master_rpc, self.worker_rpc];
        ports.extend(self.journal);
        ports
    }
}

/// Pick ports for a runtime: drawn from the allocator under host networking,
/// fixed defaults otherwise.
pub(crate) fn allocate_ports(
    runtime: &CacheRuntime,
    profile: &EngineProfile,
    allocator: &PortAllocator,
) -> Result<AllocatedPorts, EngineError> {
    let master_replicas = runtime.master_replicas();
    let ha = master_replicas == profile.ha_master_replicas;
    if master_replicas != 1 && !ha {
        return Err(EngineError::InvalidSpec(format!(
            "master replicas must be 1 or {}, got {master_replicas}",
            profile.ha_master_replicas
        )));
    }
    match runtime.spec.network_mode {
        NetworkMode::ContainerNetwork => Ok(AllocatedPorts {
            master_rpc: DEFAULT_MASTER_RPC_PORT,
            worker_rpc: DEFAULT_WORKER_RPC_PORT,
            journal: ha.then_some(DEFAULT_JOURNAL_PORT),
            reserved: false,
        }),
        NetworkMode::HostNetwork => {
            let n = if ha { 3 } else { 2 };
            let ports = allocator.get_available_ports(n)?;
            Ok(AllocatedPorts {
                master_rpc: ports[0],
                worker_rpc: ports[1],
                journal: ports.get(2).copied(),
                reserved: true,
            })
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeValues {
    pub fullname_override: String,
    pub image: String,
    pub image_tag: String,
    pub host_network: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_server: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub master: MasterValues,
    pub worker: WorkerValues,
    pub fuse: FuseValues,
    pub tieredstore: TieredStoreValues,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MasterValues {
    pub replicas: i32,
    pub node_selector: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    pub ports: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerValues {
    /// Workers start at zero and are scaled once nodes are assigned.
    pub replicas: i32,
    pub node_selector: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    pub ports: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FuseValues {
    pub image: String,
    pub image_tag: String,
    pub global: bool,
    pub node_selector: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TieredStoreValues {
    pub levels: Vec<LevelValues>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LevelValues {
    pub alias: String,
    pub level: usize,
    pub mediumtype: String,
    #[serde(rename = "type")]
    pub volume_type: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<String>,
    pub high: String,
    pub low: String,
}

fn pick(spec: &Option<String>, configured: &Option<String>, default: &str) -> String {
    spec.clone()
        .or_else(|| configured.clone())
        .unwrap_or_else(|| default.to_string())
}

/// Build the values document for a runtime.
pub(crate) fn render(
    runtime: &CacheRuntime,
    info: &RuntimeInfo,
    ports: &AllocatedPorts,
    settings: &EngineSettings,
) -> RuntimeValues {
    let spec = &runtime.spec;
    let prefix = info.runtime_type();

    let mut properties = spec.properties.clone();
    properties.insert(
        format!("{prefix}.master.rpc.port"),
        ports.master_rpc.to_string(),
    );
    properties.insert(
        format!("{prefix}.worker.rpc.port"),
        ports.worker_rpc.to_string(),
    );
    let mut master_ports = BTreeMap::from([("rpc".to_string(), ports.master_rpc)]);
    if let Some(journal) = ports.journal {
        properties.insert(
            format!("{prefix}.master.embedded.journal.port"),
            journal.to_string(),
        );
        master_ports.insert("embedded".to_string(), journal);
    }

    let mut worker_selector = spec.worker.node_selector.clone();
    worker_selector.insert(info.labels().common(), "true".to_string());

    let levels = spec
        .tieredstore
        .levels
        .iter()
        .enumerate()
        .map(|(i, level)| LevelValues {
            alias: level.medium_type.as_str().to_string(),
            level: i,
            mediumtype: level.medium_type.as_str().to_string(),
            volume_type: match level.volume_type {
                VolumeType::HostPath => "hostPath".to_string(),
                VolumeType::EmptyDir => "emptyDir".to_string(),
            },
            path: level.path.clone(),
            quota: level.quota.clone(),
            high: level.high.clone().unwrap_or_else(|| "0.95".to_string()),
            low: level.low.clone().unwrap_or_else(|| "0.7".to_string()),
        })
        .collect();

    RuntimeValues {
        fullname_override: runtime.name().to_string(),
        image: pick(&spec.image, &settings.image.image, DEFAULT_IMAGE),
        image_tag: pick(&spec.image_tag, &settings.image.image_tag, DEFAULT_IMAGE_TAG),
        host_network: spec.network_mode == NetworkMode::HostNetwork,
        dns_server: settings.image.dns_server.clone(),
        properties,
        master: MasterValues {
            replicas: runtime.master_replicas(),
            node_selector: spec.master.node_selector.clone(),
            resources: spec.master.resources.clone(),
            ports: master_ports,
        },
        worker: WorkerValues {
            replicas: 0,
            node_selector: worker_selector,
            resources: spec.worker.resources.clone(),
            ports: BTreeMap::from([("rpc".to_string(), ports.worker_rpc)]),
        },
        fuse: FuseValues {
            image: pick(&spec.fuse.image, &settings.image.fuse_image, DEFAULT_FUSE_IMAGE),
            image_tag: pick(
                &spec.fuse.image_tag,
                &settings.image.fuse_image_tag,
                DEFAULT_IMAGE_TAG,
            ),
            global: info.fuse().global,
            node_selector: info.fuse_node_selector(),
            resources: spec.fuse.resources.clone(),
        },
        tieredstore: TieredStoreValues { levels },
        tolerations: spec.tolerations.clone(),
    }
}
