//! Plugin discovery and the channel name directory.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use unibox_shared::constants::{META_CONNECTION_NAME, META_CONNECTION_TYPE, UNKNOWN_CHANNEL_NAME};
use unibox_shared::types::{channel_name_from_metadata, ChannelType};

/// What the host reports for one installed plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginManifest {
    pub package: String,
    pub label: String,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Enumerates plugins installed on the host.
#[async_trait]
pub trait PluginDiscovery: Send + Sync {
    async fn installed(&self) -> anyhow::Result<Vec<PluginManifest>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    pub channel_type: ChannelType,
    pub channel_name: String,
    pub package: String,
    pub label: String,
    pub version: String,
}

impl PluginInfo {
    /// Read `connection_type` / `connection_name`, defaulting to 0 / "Unknown".
    pub fn from_manifest(manifest: &PluginManifest) -> Self {
        let channel_type = ChannelType::from_metadata(
            manifest.metadata.get(META_CONNECTION_TYPE).map(String::as_str),
        );
        let channel_name = channel_name_from_metadata(
            manifest.metadata.get(META_CONNECTION_NAME).map(String::as_str),
        );
        if channel_type == ChannelType::UNKNOWN {
            warn!(package = %manifest.package, "Plugin has no usable connection_type");
        }

        Self {
            channel_type,
            channel_name,
            package: manifest.package.clone(),
            label: manifest.label.clone(),
            version: manifest.version.clone(),
        }
    }
}

/// Channel type to display name. Entries are only ever added.
#[derive(Debug, Default)]
pub struct PluginDirectory {
    names: RwLock<HashMap<ChannelType, String>>,
}

impl PluginDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a name. Returns `false` if the type already had one (kept as is).
    pub fn record(&self, channel_type: ChannelType, name: &str) -> bool {
        let mut names = self.names.write().unwrap_or_else(|e| e.into_inner());
        if names.contains_key(&channel_type) {
            return false;
        }
        debug!(channel_type = %channel_type, name, "Recorded channel name");
        names.insert(channel_type, name.to_string());
        true
    }

    pub fn name(&self, channel_type: ChannelType) -> String {
        self.names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&channel_type)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_CHANNEL_NAME.to_string())
    }

    pub fn len(&self) -> usize {
        self.names.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
