use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Log output format for the controller.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub image: ImageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    #[serde(default = "default_runtime_type")]
    pub runtime_type: String,
    /// Only reconcile runtimes in this namespace when set.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_resync_period_secs")]
    pub resync_period_secs: u64,
    #[serde(default = "default_chart")]
    pub chart: String,
    #[serde(default = "default_values_dir")]
    pub values_dir: PathBuf,
    #[serde(default = "default_graceful_shutdown_limits")]
    pub graceful_shutdown_limits: u32,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub metrics_addr: Option<String>, // e.g. 0.0.0.0:9090
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            runtime_type: default_runtime_type(),
            namespace: None,
            resync_period_secs: default_resync_period_secs(),
            chart: default_chart(),
            values_dir: default_values_dir(),
            graceful_shutdown_limits: default_graceful_shutdown_limits(),
            log_format: LogFormat::Text,
            metrics_addr: None,
        }
    }
}

fn default_runtime_type() -> String {
    "alluxio".to_string()
}

fn default_resync_period_secs() -> u64 {
    30
}

fn default_chart() -> String {
    "/charts/alluxio".to_string()
}

fn default_values_dir() -> PathBuf {
    std::env::temp_dir().join("ddc")
}

fn default_graceful_shutdown_limits() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortsConfig {
    /// Inclusive range in the form "<low>-<high>".
    #[serde(default = "default_port_range")]
    pub range: String,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range: default_port_range(),
        }
    }
}

fn default_port_range() -> String {
    "20000-26000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub query_ufs_total: bool,
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub auto_sync: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            query_ufs_total: true,
            exec_timeout_secs: default_exec_timeout_secs(),
            auto_sync: true,
        }
    }
}

fn default_poll_timeout_ms() -> u64 {
    500
}

fn default_exec_timeout_secs() -> u64 {
    1500
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ImageConfig {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub image_tag: Option<String>,
    #[serde(default)]
    pub fuse_image: Option<String>,
    #[serde(default)]
    pub fuse_image_tag: Option<String>,
    #[serde(default)]
    pub dns_server: Option<String>,
}

/// Inclusive port range handed to the port allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub base: u16,
    pub size: u16,
}

impl PortRange {
    pub fn new(base: u16, size: u16) -> Self {
        Self { base, size }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.base && u32::from(port) < u32::from(self.base) + u32::from(self.size)
    }

    pub fn last(&self) -> u16 {
        self.base + self.size.saturating_sub(1)
    }
}

impl std::str::FromStr for PortRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPortRange(s.to_string());
        let (low, high) = s.trim().split_once('-').ok_or_else(invalid)?;
        let low: u16 = low.trim().parse().map_err(|_| invalid())?;
        let high: u16 = high.trim().parse().map_err(|_| invalid())?;
        if low == 0 || high < low {
            return Err(invalid());
        }
        let size = high - low + 1;
        Ok(Self::new(low, size))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid port range {0:?}, expected <low>-<high>")]
    InvalidPortRange(String),
    #[error("invalid boolean {value:?} for {key}")]
    InvalidBool { key: String, value: String },
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                cfg
            }
            None => Self::default(),
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        // validate early so a bad range fails at startup
        cfg.port_range()?;
        Ok(cfg)
    }

    /// Overlay deployment environment variables on top of file settings.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DDC_IMAGE") {
            self.image.image = Some(v);
        }
        if let Some(v) = lookup("DDC_IMAGE_TAG") {
            self.image.image_tag = Some(v);
        }
        if let Some(v) = lookup("DDC_FUSE_IMAGE") {
            self.image.fuse_image = Some(v);
        }
        if let Some(v) = lookup("DDC_FUSE_IMAGE_TAG") {
            self.image.fuse_image_tag = Some(v);
        }
        if let Some(v) = lookup("DDC_DNS_SERVER") {
            self.image.dns_server = Some(v);
        }
        if let Some(v) = lookup("DDC_PORT_RANGE") {
            self.ports.range = v;
        }
        if let Some(v) = lookup("DDC_QUERY_UFS_TOTAL") {
            self.metadata.query_ufs_total = match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidBool {
                        key: "DDC_QUERY_UFS_TOTAL".to_string(),
                        value: v,
                    });
                }
            };
        }
        Ok(())
    }

    pub fn port_range(&self) -> Result<PortRange, ConfigError> {
        self.ports.range.parse()
    }
}
