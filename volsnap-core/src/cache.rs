//! Desired and actual state caches
//!
//! Both caches are internally synchronized maps keyed by [`SnapshotKey`].
//! Readers share the lock; a writer holds it only for its own mutation and
//! never across an await point. `list()` hands out a point-in-time copy so
//! callers can iterate while other tasks keep writing.

use crate::model::{ActualSnapshot, SnapshotKey, SnapshotRequest};
use crate::Result;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Thread-safe map from snapshot key to a cached record
#[derive(Debug)]
pub struct StateCache<V> {
    name: &'static str,
    entries: RwLock<HashMap<SnapshotKey, V>>,
}

impl<V: Clone> StateCache<V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SnapshotKey, V>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SnapshotKey, V>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the record for `key`
    pub fn insert(&self, key: SnapshotKey, value: V) {
        debug!(cache = self.name, snapshot = %key, "Adding snapshot to cache");
        self.write().insert(key, value);
    }

    /// Remove the record for `key`; absent keys are ignored
    pub fn remove(&self, key: &SnapshotKey) -> Option<V> {
        let removed = self.write().remove(key);
        if removed.is_some() {
            debug!(cache = self.name, snapshot = %key, "Removed snapshot from cache");
        }
        removed
    }

    pub fn get(&self, key: &SnapshotKey) -> Option<V> {
        self.read().get(key).cloned()
    }

    pub fn exists(&self, key: &SnapshotKey) -> bool {
        self.read().contains_key(key)
    }

    /// Snapshot of every entry at this instant
    pub fn list(&self) -> HashMap<SnapshotKey, V> {
        self.read().clone()
    }

    pub fn keys(&self) -> Vec<SnapshotKey> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Snapshots that should exist, keyed by request identity
#[derive(Debug)]
pub struct DesiredStateOfWorld {
    cache: StateCache<SnapshotRequest>,
}

impl DesiredStateOfWorld {
    pub fn new() -> Self {
        Self {
            cache: StateCache::new("desired"),
        }
    }

    /// Upsert a request; fails only when the request has no valid identity
    pub fn add(&self, request: &SnapshotRequest) -> Result<()> {
        let key = request.key()?;
        self.cache.insert(key, request.clone());
        Ok(())
    }

    pub fn delete(&self, key: &SnapshotKey) {
        self.cache.remove(key);
    }

    pub fn get(&self, key: &SnapshotKey) -> Option<SnapshotRequest> {
        self.cache.get(key)
    }

    pub fn exists(&self, key: &SnapshotKey) -> bool {
        self.cache.exists(key)
    }

    pub fn list(&self) -> HashMap<SnapshotKey, SnapshotRequest> {
        self.cache.list()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for DesiredStateOfWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshots the engine believes were successfully created
#[derive(Debug)]
pub struct ActualStateOfWorld {
    cache: StateCache<ActualSnapshot>,
}

impl ActualStateOfWorld {
    pub fn new() -> Self {
        Self {
            cache: StateCache::new("actual"),
        }
    }

    /// Upsert under the key the SnapshotData points back to
    pub fn add(&self, snapshot: ActualSnapshot) {
        self.cache.insert(snapshot.key().clone(), snapshot);
    }

    pub fn delete(&self, key: &SnapshotKey) {
        self.cache.remove(key);
    }

    pub fn get(&self, key: &SnapshotKey) -> Option<ActualSnapshot> {
        self.cache.get(key)
    }

    pub fn exists(&self, key: &SnapshotKey) -> bool {
        self.cache.exists(key)
    }

    pub fn list(&self) -> HashMap<SnapshotKey, ActualSnapshot> {
        self.cache.list()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for ActualStateOfWorld {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SnapshotData, SnapshotSource};
    use std::sync::Arc;

    fn actual(namespace: &str, name: &str) -> ActualSnapshot {
        let request = SnapshotRequest::new(namespace, name, "pvc");
        let data = SnapshotData::new(
            request.key().unwrap(),
            "pv",
            SnapshotSource::Memory {
                snapshot_id: format!("mem-{name}"),
            },
            "ctrl",
        );
        ActualSnapshot { request, data }
    }

    #[test]
    fn test_desired_add_is_idempotent_upsert() {
        let desired = DesiredStateOfWorld::new();
        let request = SnapshotRequest::new("default", "snap-1", "pvc-1");
        desired.add(&request).unwrap();
        desired.add(&request).unwrap();
        assert_eq!(desired.len(), 1);

        let mut updated = request.clone();
        updated.spec.snapshot_data_name = Some("data-1".to_string());
        desired.add(&updated).unwrap();

        let key = request.key().unwrap();
        assert_eq!(desired.get(&key).unwrap(), updated);
    }

    #[test]
    fn test_desired_rejects_request_without_identity() {
        let desired = DesiredStateOfWorld::new();
        let request = SnapshotRequest::new("", "snap-1", "pvc-1");
        assert!(desired.add(&request).is_err());
        assert!(desired.is_empty());
    }

    #[test]
    fn test_delete_missing_key_is_noop() {
        let desired = DesiredStateOfWorld::new();
        let key = SnapshotKey::new("default", "missing").unwrap();
        desired.delete(&key);
        assert!(!desired.exists(&key));

        let actual_state = ActualStateOfWorld::new();
        actual_state.delete(&key);
        assert!(actual_state.is_empty());
    }

    #[test]
    fn test_actual_keyed_by_data_back_reference() {
        let actual_state = ActualStateOfWorld::new();
        actual_state.add(actual("default", "snap-1"));

        let key = SnapshotKey::new("default", "snap-1").unwrap();
        assert!(actual_state.exists(&key));
        assert_eq!(
            actual_state.get(&key).unwrap().data.spec.source.id(),
            "mem-snap-1"
        );
    }

    #[test]
    fn test_list_is_a_detached_copy() {
        let actual_state = ActualStateOfWorld::new();
        actual_state.add(actual("default", "a"));

        let listed = actual_state.list();
        actual_state.add(actual("default", "b"));
        actual_state.delete(&SnapshotKey::new("default", "a").unwrap());

        assert_eq!(listed.len(), 1);
        assert!(listed.contains_key(&SnapshotKey::new("default", "a").unwrap()));
        assert_eq!(actual_state.len(), 1);
    }

    #[test]
    fn test_concurrent_writers() {
        let desired = Arc::new(DesiredStateOfWorld::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let desired = Arc::clone(&desired);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let request =
                            SnapshotRequest::new("default", format!("snap-{i}-{j}"), "pvc");
                        desired.add(&request).unwrap();
                        let _ = desired.list();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(desired.len(), 400);
    }

    #[test]
    fn test_generic_cache_keys() {
        let cache: StateCache<u32> = StateCache::new("test");
        let key = SnapshotKey::new("ns", "a").unwrap();
        cache.insert(key.clone(), 7);
        assert_eq!(cache.keys(), vec![key.clone()]);
        assert_eq!(cache.remove(&key), Some(7));
        assert_eq!(cache.remove(&key), None);
    }
}
