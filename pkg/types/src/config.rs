use serde::{Deserialize, Serialize};

/// Proxy configuration file (YAML).
///
/// Example `proxy-config.yaml`:
/// ```yaml
/// server: http://10.0.0.1:6443
/// hostname: worker-1
/// node-ip: 10.0.0.21
/// cluster-cidr: 10.42.0.0/16
/// masquerade-all: false
/// nodeport-addresses: [10.0.0.0/24]
/// min-sync-period: 1
/// sync-period: 30
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfigFile {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default, alias = "node-ip")]
    pub node_ip: Option<String>,
    #[serde(default, alias = "cluster-cidr")]
    pub cluster_cidr: Option<String>,
    #[serde(default, alias = "masquerade-all")]
    pub masquerade_all: Option<bool>,
    #[serde(default, alias = "masquerade-bit")]
    pub masquerade_bit: Option<u32>,
    #[serde(default, alias = "nodeport-addresses")]
    pub nodeport_addresses: Option<Vec<String>>,
    #[serde(default, alias = "min-sync-period")]
    pub min_sync_period: Option<u64>,
    #[serde(default, alias = "sync-period")]
    pub sync_period: Option<u64>,
    #[serde(default, alias = "burst-syncs")]
    pub burst_syncs: Option<u32>,
    #[serde(default, alias = "poll-interval")]
    pub poll_interval: Option<u64>,
    #[serde(default, alias = "health-bind-address")]
    pub health_bind_address: Option<String>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
