/*!
In-process object store.
*/

use super::{check_version, ensure_uid, ObjectStore, WatchEvent, WATCH_CHANNEL_CAPACITY};
use crate::model::{SnapshotData, SnapshotKey, SnapshotRequest, Volume, VolumeClaim};
use crate::{Result, SnapshotError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

#[derive(Debug, Default)]
struct Records {
    requests: HashMap<SnapshotKey, SnapshotRequest>,
    data: HashMap<String, SnapshotData>,
    claims: HashMap<(String, String), VolumeClaim>,
    volumes: HashMap<String, Volume>,
    next_version: u64,
}

impl Records {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// Object store kept in memory, shared between clones
///
/// Write failures can be injected with [`MemoryObjectStore::fail_next_writes`]
/// to exercise retry paths.
#[derive(Debug, Clone)]
pub struct MemoryObjectStore {
    records: Arc<Mutex<Records>>,
    events: broadcast::Sender<WatchEvent>,
    failing_writes: Arc<AtomicUsize>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::with_watch_capacity(WATCH_CHANNEL_CAPACITY)
    }

    /// Store whose watch channel buffers only `capacity` events
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            records: Arc::new(Mutex::new(Records::default())),
            events,
            failing_writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `count` writes fail with a transient store error
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_write(&self) -> Result<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(SnapshotError::store("injected write failure")),
            Err(_) => Ok(()),
        }
    }

    fn notify(&self, event: WatchEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_requests(&self) -> Result<Vec<SnapshotRequest>> {
        Ok(self.lock().requests.values().cloned().collect())
    }

    async fn get_request(&self, key: &SnapshotKey) -> Result<SnapshotRequest> {
        self.lock()
            .requests
            .get(key)
            .cloned()
            .ok_or_else(|| SnapshotError::not_found(format!("snapshot request {key}")))
    }

    async fn create_request(&self, mut request: SnapshotRequest) -> Result<SnapshotRequest> {
        self.check_write()?;
        let key = request.key()?;
        let stored = {
            let mut records = self.lock();
            if records.requests.contains_key(&key) {
                return Err(SnapshotError::Conflict(format!(
                    "snapshot request {key} already exists"
                )));
            }
            ensure_uid(&mut request.metadata.uid);
            request.metadata.resource_version = records.bump();
            records.requests.insert(key, request.clone());
            request
        };
        self.notify(WatchEvent::Added(stored.clone()));
        Ok(stored)
    }

    async fn update_request(&self, mut request: SnapshotRequest) -> Result<SnapshotRequest> {
        self.check_write()?;
        let key = request.key()?;
        let stored = {
            let mut records = self.lock();
            let existing = records
                .requests
                .get(&key)
                .ok_or_else(|| SnapshotError::not_found(format!("snapshot request {key}")))?;
            check_version(
                &format!("snapshot request {key}"),
                &existing.metadata,
                &request.metadata,
            )?;
            request.metadata.uid = existing.metadata.uid.clone();
            request.metadata.resource_version = records.bump();
            records.requests.insert(key, request.clone());
            request
        };
        self.notify(WatchEvent::Modified(stored.clone()));
        Ok(stored)
    }

    async fn delete_request(&self, key: &SnapshotKey) -> Result<()> {
        self.check_write()?;
        let removed = self.lock().requests.remove(key);
        match removed {
            Some(request) => {
                self.notify(WatchEvent::Deleted(request));
                Ok(())
            }
            None => Err(SnapshotError::not_found(format!("snapshot request {key}"))),
        }
    }

    async fn list_data(&self) -> Result<Vec<SnapshotData>> {
        Ok(self.lock().data.values().cloned().collect())
    }

    async fn get_data(&self, name: &str) -> Result<SnapshotData> {
        self.lock()
            .data
            .get(name)
            .cloned()
            .ok_or_else(|| SnapshotError::not_found(format!("snapshot data {name}")))
    }

    async fn create_data(&self, mut data: SnapshotData) -> Result<SnapshotData> {
        self.check_write()?;
        let mut records = self.lock();
        if records.data.contains_key(data.name()) {
            return Err(SnapshotError::Conflict(format!(
                "snapshot data {} already exists",
                data.name()
            )));
        }
        ensure_uid(&mut data.metadata.uid);
        data.metadata.resource_version = records.bump();
        records.data.insert(data.name().to_string(), data.clone());
        Ok(data)
    }

    async fn update_data(&self, mut data: SnapshotData) -> Result<SnapshotData> {
        self.check_write()?;
        let mut records = self.lock();
        let existing = records
            .data
            .get(data.name())
            .ok_or_else(|| SnapshotError::not_found(format!("snapshot data {}", data.name())))?;
        check_version(
            &format!("snapshot data {}", data.name()),
            &existing.metadata,
            &data.metadata,
        )?;
        data.metadata.uid = existing.metadata.uid.clone();
        data.metadata.resource_version = records.bump();
        records.data.insert(data.name().to_string(), data.clone());
        Ok(data)
    }

    async fn delete_data(&self, name: &str) -> Result<()> {
        self.check_write()?;
        match self.lock().data.remove(name) {
            Some(_) => Ok(()),
            None => Err(SnapshotError::not_found(format!("snapshot data {name}"))),
        }
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<VolumeClaim> {
        self.lock()
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| SnapshotError::not_found(format!("volume claim {namespace}/{name}")))
    }

    async fn put_claim(&self, mut claim: VolumeClaim) -> Result<VolumeClaim> {
        self.check_write()?;
        let mut records = self.lock();
        ensure_uid(&mut claim.metadata.uid);
        claim.metadata.resource_version = records.bump();
        let id = (claim.metadata.namespace.clone(), claim.metadata.name.clone());
        records.claims.insert(id, claim.clone());
        Ok(claim)
    }

    async fn get_volume(&self, name: &str) -> Result<Volume> {
        self.lock()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| SnapshotError::not_found(format!("volume {name}")))
    }

    async fn put_volume(&self, mut volume: Volume) -> Result<Volume> {
        self.check_write()?;
        let mut records = self.lock();
        ensure_uid(&mut volume.metadata.uid);
        volume.metadata.resource_version = records.bump();
        records
            .volumes
            .insert(volume.name().to_string(), volume.clone());
        Ok(volume)
    }

    fn watch_requests(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SnapshotSource, VolumeSource};

    #[tokio::test]
    async fn test_request_lifecycle_emits_events() {
        let store = MemoryObjectStore::new();
        let mut events = store.watch_requests();

        let created = store
            .create_request(SnapshotRequest::new("default", "snap-1", "pvc-1"))
            .await
            .unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert!(matches!(events.recv().await.unwrap(), WatchEvent::Added(_)));

        let mut updated = created.clone();
        updated.spec.snapshot_data_name = Some("data-1".to_string());
        updated.metadata.uid = String::new();
        let updated = store.update_request(updated).await.unwrap();
        assert_eq!(updated.metadata.uid, created.metadata.uid);
        assert!(updated.metadata.resource_version > created.metadata.resource_version);
        assert!(matches!(
            events.recv().await.unwrap(),
            WatchEvent::Modified(_)
        ));

        let key = created.key().unwrap();
        store.delete_request(&key).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            WatchEvent::Deleted(_)
        ));
        assert!(store.get_request(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_conflict_and_missing_update() {
        let store = MemoryObjectStore::new();
        let request = SnapshotRequest::new("default", "snap-1", "pvc-1");
        store.create_request(request.clone()).await.unwrap();

        let err = store.create_request(request).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Conflict(_)));

        let missing = SnapshotRequest::new("default", "other", "pvc-1");
        assert!(store.update_request(missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected() {
        let store = MemoryObjectStore::new();
        let created = store
            .create_request(SnapshotRequest::new("default", "snap-1", "pvc-1"))
            .await
            .unwrap();

        let mut edited = created.clone();
        edited
            .metadata
            .labels
            .insert("team".to_string(), "storage".to_string());
        store.update_request(edited).await.unwrap();

        let mut stale = created;
        stale.spec.snapshot_data_name = Some("data-1".to_string());
        let err = store.update_request(stale).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Conflict(_)));

        let key = SnapshotKey::new("default", "snap-1").unwrap();
        let stored = store.get_request(&key).await.unwrap();
        assert_eq!(stored.metadata.labels.get("team").map(String::as_str), Some("storage"));
        assert_eq!(stored.snapshot_data_name(), None);
    }

    #[tokio::test]
    async fn test_data_crud() {
        let store = MemoryObjectStore::new();
        let key = SnapshotKey::new("default", "snap-1").unwrap();
        let data = SnapshotData::new(
            key,
            "pv-1",
            SnapshotSource::Memory {
                snapshot_id: "m-1".to_string(),
            },
            "ctrl",
        );

        let stored = store.create_data(data.clone()).await.unwrap();
        assert_eq!(store.get_data(data.name()).await.unwrap(), stored);
        assert_eq!(store.list_data().await.unwrap().len(), 1);

        store.delete_data(data.name()).await.unwrap();
        assert!(store.delete_data(data.name()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_claims_and_volumes() {
        let store = MemoryObjectStore::new();
        store
            .put_claim(VolumeClaim::bound("default", "pvc-1", "pv-1"))
            .await
            .unwrap();
        store
            .put_volume(Volume::new(
                "pv-1",
                VolumeSource::Memory {
                    volume_id: "vol-1".to_string(),
                },
            ))
            .await
            .unwrap();

        let claim = store.get_claim("default", "pvc-1").await.unwrap();
        assert_eq!(claim.volume_name.as_deref(), Some("pv-1"));
        assert!(store.get_claim("other", "pvc-1").await.is_err());
        assert_eq!(store.get_volume("pv-1").await.unwrap().name(), "pv-1");
    }

    #[tokio::test]
    async fn test_injected_write_failures() {
        let store = MemoryObjectStore::new();
        store.fail_next_writes(2);

        let request = SnapshotRequest::new("default", "snap-1", "pvc-1");
        assert!(matches!(
            store.create_request(request.clone()).await,
            Err(SnapshotError::Store(_))
        ));
        assert!(store.create_request(request.clone()).await.is_err());
        assert!(store.create_request(request).await.is_ok());
    }
}
