/*!
Object store holding snapshot requests, SnapshotData, claims and volumes.

The engine talks to the store only through [`ObjectStore`]. Change
notifications for requests are delivered on a `tokio::sync::broadcast`
channel: delivery is at-least-once and a slow subscriber may miss events
(reported as `RecvError::Lagged`), so consumers must be able to re-list.
*/

pub mod file;
pub mod memory;

pub use file::FileObjectStore;
pub use memory::MemoryObjectStore;

use crate::model::{ObjectMeta, SnapshotData, SnapshotKey, SnapshotRequest, Volume, VolumeClaim};
use crate::{Result, SnapshotError};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Buffered events per watch channel before subscribers start lagging
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Change notification for a snapshot request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(SnapshotRequest),
    Modified(SnapshotRequest),
    Deleted(SnapshotRequest),
}

impl WatchEvent {
    pub fn request(&self) -> &SnapshotRequest {
        match self {
            Self::Added(request) | Self::Modified(request) | Self::Deleted(request) => request,
        }
    }
}

/// Access to the records the engine reads and writes
///
/// `get_*` and `delete_*` return [`crate::SnapshotError::NotFound`] for
/// missing records; `create_*` returns [`crate::SnapshotError::Conflict`]
/// when the record already exists. Writes return the stored record with its
/// bumped resource version.
///
/// `update_*` is a compare-and-swap on `resource_version`: a record carrying
/// a non-zero version that no longer matches the stored one is rejected with
/// [`crate::SnapshotError::Conflict`]. Version zero overwrites unconditionally.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_requests(&self) -> Result<Vec<SnapshotRequest>>;

    async fn get_request(&self, key: &SnapshotKey) -> Result<SnapshotRequest>;

    /// Store a new request, assigning its uid
    async fn create_request(&self, request: SnapshotRequest) -> Result<SnapshotRequest>;

    async fn update_request(&self, request: SnapshotRequest) -> Result<SnapshotRequest>;

    async fn delete_request(&self, key: &SnapshotKey) -> Result<()>;

    async fn list_data(&self) -> Result<Vec<SnapshotData>>;

    async fn get_data(&self, name: &str) -> Result<SnapshotData>;

    async fn create_data(&self, data: SnapshotData) -> Result<SnapshotData>;

    async fn update_data(&self, data: SnapshotData) -> Result<SnapshotData>;

    async fn delete_data(&self, name: &str) -> Result<()>;

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<VolumeClaim>;

    /// Create or replace a claim
    async fn put_claim(&self, claim: VolumeClaim) -> Result<VolumeClaim>;

    async fn get_volume(&self, name: &str) -> Result<Volume>;

    /// Create or replace a volume
    async fn put_volume(&self, volume: Volume) -> Result<Volume>;

    /// Subscribe to request change notifications
    fn watch_requests(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Assign a fresh uid if the record does not have one yet
pub(crate) fn ensure_uid(uid: &mut String) {
    if uid.is_empty() {
        *uid = uuid::Uuid::new_v4().to_string();
    }
}

/// Reject an update written against a stale copy of the record
pub(crate) fn check_version(what: &str, stored: &ObjectMeta, update: &ObjectMeta) -> Result<()> {
    if update.resource_version != 0 && update.resource_version != stored.resource_version {
        return Err(SnapshotError::Conflict(format!(
            "{what} was modified concurrently (version {} is stale, current is {})",
            update.resource_version, stored.resource_version
        )));
    }
    Ok(())
}
