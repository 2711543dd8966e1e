/*!
Backend plugin contract.

One [`SnapshotPlugin`] implementation exists per storage technology. The
Snapshotter is the only caller; plugins hold no per-snapshot state beyond
their connection handle, so every call carries the records it needs.
*/

#[cfg(feature = "hostpath")]
pub mod hostpath;
pub mod memory;

#[cfg(feature = "hostpath")]
pub use hostpath::HostPathPlugin;
pub use memory::MemoryPlugin;

use crate::config::BackendConfig;
use crate::model::{BackendKind, Condition, SnapshotData, SnapshotSource, SnapshotTags, Volume};
use crate::{Result, SnapshotError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Result of a successful `snapshot_create` or `find_snapshot`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSnapshot {
    pub source: SnapshotSource,
    /// Initial conditions; a Pending last entry means the backend is still working
    pub conditions: Vec<Condition>,
}

/// Result of `describe_snapshot`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDescription {
    pub conditions: Vec<Condition>,
    /// True once the snapshot reached a terminal state (Ready or Error)
    pub complete: bool,
}

/// Snapshot operations for one storage backend
#[async_trait]
pub trait SnapshotPlugin: Send + Sync {
    /// Backend kind this plugin serves
    fn kind(&self) -> BackendKind;

    /// Bind to the backend described by `provider`
    async fn init(&self, provider: &BackendConfig) -> Result<()>;

    /// Snapshot `volume`, attaching `tags` so the snapshot can be found again
    async fn snapshot_create(&self, volume: &Volume, tags: &SnapshotTags)
        -> Result<CreatedSnapshot>;

    /// Delete the backend snapshot; deleting an absent snapshot succeeds
    async fn snapshot_delete(&self, source: &SnapshotSource) -> Result<()>;

    /// Current conditions of the snapshot behind `data`
    async fn describe_snapshot(&self, data: &SnapshotData) -> Result<SnapshotDescription>;

    /// Look up a snapshot by the exact tag set it was created with
    ///
    /// Backends that cannot search return `Ok(None)`.
    async fn find_snapshot(&self, tags: &SnapshotTags) -> Result<Option<CreatedSnapshot>>;

    /// Delete the source volume itself
    async fn volume_delete(&self, volume: &Volume) -> Result<()>;
}

/// Plugins available to the Snapshotter, keyed by backend kind
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<BackendKind, Arc<dyn SnapshotPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin, replacing any earlier one for the same kind
    pub fn register(&mut self, plugin: Arc<dyn SnapshotPlugin>) {
        self.plugins.insert(plugin.kind(), plugin);
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn SnapshotPlugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn SnapshotPlugin>> {
        self.plugins
            .get(&kind)
            .cloned()
            .ok_or_else(|| SnapshotError::UnsupportedBackend(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        self.plugins.keys().copied().collect()
    }

    /// Build and initialize the plugin selected by configuration
    pub async fn from_config(backend: &BackendConfig) -> Result<Self> {
        let plugin: Arc<dyn SnapshotPlugin> = match backend {
            #[cfg(feature = "hostpath")]
            BackendConfig::HostPath { .. } => Arc::new(HostPathPlugin::new()),
            #[cfg(not(feature = "hostpath"))]
            BackendConfig::HostPath { .. } => {
                return Err(SnapshotError::UnsupportedBackend(
                    "hostPath (built without the hostpath feature)".to_string(),
                ))
            }
            BackendConfig::Memory => Arc::new(MemoryPlugin::new()),
        };
        plugin.init(backend).await?;
        Ok(Self::new().with_plugin(plugin))
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
