use std::collections::BTreeMap;

use crate::api::{CacheRuntime, Dataset, PlacementMode, TieredStore};
use crate::labels::LabelNames;
use crate::units::{UnitsError, parse_quantity};

/// How the fuse client is deployed for a runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuseDeploy {
    /// Fuse runs on every node matching `node_selector`, independent of cache placement.
    pub global: bool,
    pub node_selector: BTreeMap<String, String>,
}

/// Per-tier quota totals in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierQuota {
    pub memory: u64,
    pub disk: u64,
}

impl TierQuota {
    pub fn total(&self) -> u64 {
        self.memory + self.disk
    }
}

/// Immutable view of a runtime used for the duration of one reconcile pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeInfo {
    name: String,
    namespace: String,
    runtime_type: String,
    owner_dataset_uid: Option<String>,
    placement: PlacementMode,
    tiered_store: TieredStore,
    fuse: FuseDeploy,
    deprecated_node_labels: bool,
}

impl RuntimeInfo {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        runtime_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            runtime_type: runtime_type.into(),
            owner_dataset_uid: None,
            placement: PlacementMode::Exclusive,
            tiered_store: TieredStore::default(),
            fuse: FuseDeploy::default(),
            deprecated_node_labels: false,
        }
    }

    /// Build the view from the runtime object and its bound dataset, if any.
    pub fn from_runtime(
        runtime: &CacheRuntime,
        dataset: Option<&Dataset>,
        runtime_type: &str,
    ) -> Self {
        let mut info = Self::new(runtime.name(), runtime.namespace(), runtime_type)
            .with_tiered_store(runtime.spec.tieredstore.clone())
            .with_fuse(FuseDeploy {
                global: runtime.spec.fuse.global,
                node_selector: runtime.spec.fuse.node_selector.clone(),
            });
        if let Some(dataset) = dataset {
            info = info
                .with_placement(dataset.spec.placement)
                .with_owner_dataset_uid(dataset.metadata.uid.clone());
        }
        info
    }

    pub fn with_placement(mut self, placement: PlacementMode) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_tiered_store(mut self, tiered_store: TieredStore) -> Self {
        self.tiered_store = tiered_store;
        self
    }

    pub fn with_fuse(mut self, fuse: FuseDeploy) -> Self {
        self.fuse = fuse;
        self
    }

    pub fn with_owner_dataset_uid(mut self, uid: Option<String>) -> Self {
        self.owner_dataset_uid = uid;
        self
    }

    pub fn with_deprecated_node_labels(mut self, deprecated: bool) -> Self {
        self.deprecated_node_labels = deprecated;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn runtime_type(&self) -> &str {
        &self.runtime_type
    }

    pub fn owner_dataset_uid(&self) -> Option<&str> {
        self.owner_dataset_uid.as_deref()
    }

    pub fn placement(&self) -> PlacementMode {
        self.placement
    }

    pub fn is_exclusive(&self) -> bool {
        self.placement == PlacementMode::Exclusive
    }

    pub fn tiered_store(&self) -> &TieredStore {
        &self.tiered_store
    }

    pub fn fuse(&self) -> &FuseDeploy {
        &self.fuse
    }

    pub fn is_deprecated_node_labels(&self) -> bool {
        self.deprecated_node_labels
    }

    pub fn labels(&self) -> LabelNames {
        LabelNames::new(&self.namespace, &self.name, &self.runtime_type)
            .with_owner_dataset_uid(self.owner_dataset_uid.clone())
            .with_deprecated(self.deprecated_node_labels)
    }

    /// Sum the configured quotas per medium. Levels without a quota count as zero.
    pub fn tier_quota(&self) -> Result<TierQuota, UnitsError> {
        let mut quota = TierQuota::default();
        for level in &self.tiered_store.levels {
            let Some(q) = level.quota.as_deref() else {
                continue;
            };
            let bytes = parse_quantity(q)?;
            if level.medium_type.is_memory() {
                quota.memory += bytes;
            } else {
                quota.disk += bytes;
            }
        }
        Ok(quota)
    }

    /// Node selector for the fuse client: the configured selector when global,
    /// otherwise the cache nodes of this dataset.
    pub fn fuse_node_selector(&self) -> BTreeMap<String, String> {
        if self.fuse.global {
            self.fuse.node_selector.clone()
        } else {
            BTreeMap::from([(self.labels().common(), "true".to_string())])
        }
    }
}
