//! Settings file for the `cluster-hub` binary.
//!
//! JSON, camelCase. Every field is optional; a missing file means defaults.
//!
//! ```json
//! {
//!   "listen": "0.0.0.0:9400",
//!   "relayUrl": "ws://127.0.0.1:9400",
//!   "namespaces": ["/", "/chat"],
//!   "cluster": { "heartbeatIntervalMs": 5000, "aggregation": "count" }
//! }
//! ```

use anyhow::{Context, Result, anyhow};
use cluster_core::ClusterConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubSettings {
    /// Relay listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Relay URL a node connects to
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    /// Namespaces a node serves
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<String>,

    #[serde(default)]
    pub cluster: ClusterConfig,
}

fn default_listen() -> String {
    "0.0.0.0:9400".to_string()
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:9400".to_string()
}

fn default_namespaces() -> Vec<String> {
    vec!["/".to_string()]
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            relay_url: default_relay_url(),
            namespaces: default_namespaces(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl HubSettings {
    /// Load settings from `path`, or defaults when there is no file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings file: {:?}", path))?;
                let settings: HubSettings = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse settings file: {:?}", path))?;
                tracing::info!("Loaded settings from {:?}", path);
                settings
            }
            Some(path) => {
                tracing::info!("No settings file found at {:?}, using defaults", path);
                HubSettings::default()
            }
            None => HubSettings::default(),
        };

        settings
            .cluster
            .validate()
            .map_err(|e| anyhow!("Invalid cluster settings: {}", e))?;
        Ok(settings)
    }
}
