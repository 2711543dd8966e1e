/*!
# volsnap core engine

Reconciliation engine for point-in-time volume snapshots.

Users declare snapshot requests; the engine makes sure each one is backed by
exactly one backend snapshot and one SnapshotData record, and removes both
once the request goes away. It is built from a handful of cooperating parts:

- a request mirror following the object store, feeding the desired state
- desired and actual state caches keyed by `namespace/name`
- a populator re-adding mirrored requests periodically
- a reconciler comparing the caches on a short tick
- a snapshotter running one task per create or delete, deduplicated per key
- pluggable backends (`hostPath` archives, in-memory for tests)

## Usage

```rust,no_run
use std::sync::Arc;
use volsnap_core::{ControllerConfig, FileObjectStore, SnapshotController};

# async fn example() -> volsnap_core::Result<()> {
let store = Arc::new(FileObjectStore::open("/var/lib/volsnap")?);
let config = ControllerConfig::host_path("/var/lib/volsnap/archives");
let controller = SnapshotController::from_config(config, store).await?;

let (stop, shutdown) = tokio::sync::watch::channel(false);
tokio::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    stop.send_replace(true);
});
controller.run(shutdown).await?;
# Ok(())
# }
```
*/

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod mirror;
pub mod model;
pub mod observability;
pub mod operation;
pub mod plugin;
pub mod populator;
pub mod reconciler;
pub mod snapshotter;
pub mod store;

mod snapshotter_tests;

pub use cache::{ActualStateOfWorld, DesiredStateOfWorld};
pub use config::{BackendConfig, ControllerConfig, SnapshotWaitConfig};
pub use controller::SnapshotController;
pub use error::{Result, SnapshotError};
pub use mirror::{RequestEvent, RequestMirror};
pub use model::{
    ActualSnapshot, Condition, ConditionStatus, ConditionType, SimplifiedStatus, SnapshotData,
    SnapshotKey, SnapshotRequest, SnapshotSource, Volume, VolumeClaim, VolumeSource,
};
pub use operation::{OperationKind, OperationMap};
pub use plugin::{MemoryPlugin, PluginRegistry, SnapshotPlugin};
#[cfg(feature = "hostpath")]
pub use plugin::HostPathPlugin;
pub use populator::DesiredStatePopulator;
pub use reconciler::{Reconciler, TickSummary};
pub use snapshotter::{Dispatch, SnapshotOperations, Snapshotter};
pub use store::{FileObjectStore, MemoryObjectStore, ObjectStore, WatchEvent};
