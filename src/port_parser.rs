//! Reading reserved ports back out of persisted release values.
//!
//! Every runtime's rendered values are kept in a ConfigMap. Port numbers live in
//! the `properties` map under keys ending in `.port`.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Key holding the YAML values inside the values ConfigMap.
pub const VALUES_KEY: &str = "data";

pub fn values_configmap_name(name: &str, runtime_type: &str) -> String {
    format!("{name}-{runtime_type}-values")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedValues {
    /// Values written before the flag existed were always host-network.
    #[serde(default = "host_network_default")]
    host_network: bool,
    #[serde(default)]
    properties: BTreeMap<String, serde_yaml::Value>,
}

fn host_network_default() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum PortParseError {
    #[error("values are not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("property {key} has invalid port {value:?}")]
    InvalidPort { key: String, value: String },
}

/// Extract every port reserved by a values document, sorted and deduplicated.
///
/// Container-network values carry fixed in-pod ports that never came from the
/// host port range, so they yield nothing.
pub fn parse_ports_from_values(yaml: &str) -> Result<Vec<u16>, PortParseError> {
    let values: PersistedValues = serde_yaml::from_str(yaml)?;
    if !values.host_network {
        return Ok(Vec::new());
    }
    let mut ports = Vec::new();
    for (key, value) in values.properties {
        if !key.ends_with(".port") {
            continue;
        }
        let raw = match &value {
            serde_yaml::Value::String(s) => s.clone(),
            serde_yaml::Value::Number(n) => n.to_string(),
            other => format!("{other:?}"),
        };
        let port = raw
            .trim()
            .parse::<u16>()
            .map_err(|_| PortParseError::InvalidPort {
                key: key.clone(),
                value: raw.clone(),
            })?;
        ports.push(port);
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_port_properties() {
        let yaml = r#"
fullnameOverride: hbase
properties:
  alluxio.master.rpc.port: "20000"
  alluxio.worker.rpc.port: 20001
  alluxio.master.embedded.journal.port: "20002"
  alluxio.user.block.size.bytes.default: 16MB
master:
  replicas: 3
"#;
        assert_eq!(
            parse_ports_from_values(yaml).unwrap(),
            vec![20000, 20001, 20002]
        );
    }

    #[test]
    fn container_network_values_hold_no_host_ports() {
        let yaml = r#"
hostNetwork: false
properties:
  alluxio.master.rpc.port: "19998"
  alluxio.worker.rpc.port: "29999"
"#;
        assert!(parse_ports_from_values(yaml).unwrap().is_empty());
        let host = yaml.replace("hostNetwork: false", "hostNetwork: true");
        assert_eq!(parse_ports_from_values(&host).unwrap(), vec![19998, 29999]);
    }

    #[test]
    fn missing_properties_yield_nothing() {
        assert!(parse_ports_from_values("image: x\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_garbage_port() {
        let yaml = "properties:\n  a.port: nope\n";
        assert!(matches!(
            parse_ports_from_values(yaml),
            Err(PortParseError::InvalidPort { .. })
        ));
    }
}
