//! Node label names owned by a runtime.
//!
//! Every label the controller writes onto a node is built here, one function
//! per category, so the ledger and the scale-in path agree on spelling.

/// Shared counter of datasets cached on a node.
pub const DATASET_NUM: &str = "fluid.io/dataset-num";
/// Key of the exclusive owner label; the value is `<ns>_<name>`.
pub const EXCLUSIVE: &str = "fluid_exclusive";

const STORAGE_PREFIX: &str = "fluid.io/s-";
const FUSE_PREFIX: &str = "fluid.io/f-";
const HUMAN_READ: &str = "h-";

const DEPRECATED_STORAGE_PREFIX: &str = "data.fluid.io/storage-";
const DEPRECATED_HUMAN_READ: &str = "human-";

/// Longest label name (after the prefix) accepted by the API server, exclusive.
const MAX_LABEL_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityTier {
    Memory,
    Disk,
    Total,
}

impl CapacityTier {
    pub const ALL: [CapacityTier; 3] = [CapacityTier::Memory, CapacityTier::Disk, CapacityTier::Total];

    fn suffix(&self, deprecated: bool) -> &'static str {
        match (self, deprecated) {
            (CapacityTier::Memory, false) => "m",
            (CapacityTier::Disk, false) => "d",
            (CapacityTier::Total, false) => "t",
            (CapacityTier::Memory, true) => "mem",
            (CapacityTier::Disk, true) => "disk",
            (CapacityTier::Total, true) => "total",
        }
    }
}

/// Label names for a single runtime identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelNames {
    namespace: String,
    name: String,
    runtime_type: String,
    owner_dataset_uid: Option<String>,
    deprecated: bool,
}

impl LabelNames {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        runtime_type: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            runtime_type: runtime_type.into(),
            owner_dataset_uid: None,
            deprecated: false,
        }
    }

    pub fn with_owner_dataset_uid(mut self, uid: Option<String>) -> Self {
        self.owner_dataset_uid = uid.filter(|u| !u.is_empty());
        self
    }

    pub fn with_deprecated(mut self, deprecated: bool) -> Self {
        self.deprecated = deprecated;
        self
    }

    fn storage_prefix(&self) -> &'static str {
        if self.deprecated {
            DEPRECATED_STORAGE_PREFIX
        } else {
            STORAGE_PREFIX
        }
    }

    /// `<prefix><ns>-<name>`, or `<prefix><owner uid>` once that would be too long.
    fn namespaced(&self, prefix: &str) -> String {
        let full = format!("{prefix}{}-{}", self.namespace, self.name);
        if full.len() < MAX_LABEL_NAME_LEN {
            return full;
        }
        match &self.owner_dataset_uid {
            Some(uid) => format!("{prefix}{uid}"),
            None => full,
        }
    }

    /// Marks a node as a cache node of this runtime.
    pub fn runtime(&self) -> String {
        self.namespaced(&format!("{}{}-", self.storage_prefix(), self.runtime_type))
    }

    /// Marks a node as holding this dataset, whatever the runtime type.
    pub fn common(&self) -> String {
        self.namespaced(self.storage_prefix())
    }

    pub fn capacity(&self, tier: CapacityTier) -> String {
        let read = if self.deprecated {
            DEPRECATED_HUMAN_READ
        } else {
            HUMAN_READ
        };
        let prefix = format!(
            "{}{read}{}-{}",
            self.storage_prefix(),
            self.runtime_type,
            tier.suffix(self.deprecated)
        );
        self.namespaced(&format!("{prefix}-"))
    }

    pub fn fuse(&self) -> String {
        self.namespaced(FUSE_PREFIX)
    }

    pub fn exclusive_value(&self) -> String {
        format!("{}_{}", self.namespace, self.name)
    }

    /// Every label this runtime may own on a node, excluding the shared counter
    /// and the exclusive label.
    pub fn owned(&self) -> Vec<String> {
        let mut names = vec![self.runtime(), self.common()];
        names.extend(CapacityTier::ALL.iter().map(|t| self.capacity(*t)));
        names
    }
}

/// The legacy common label, used to detect nodes labelled by older releases.
pub fn deprecated_common(namespace: &str, name: &str) -> String {
    format!("{DEPRECATED_STORAGE_PREFIX}{namespace}-{name}")
}

/// `key=true` selector for a flag label.
pub fn flag_selector(label: &str) -> String {
    format!("{label}=true")
}
