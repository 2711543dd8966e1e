//! Local mirror of the snapshot requests held by the object store
//!
//! The mirror lists every request once, then follows the store's watch
//! channel. Watch delivery may skip events; when the subscriber lags or the
//! channel closes the mirror lists again and reports the differences as
//! synthetic events, so consumers see a consistent stream either way.

use crate::controller::shutdown_requested;
use crate::model::{SnapshotKey, SnapshotRequest};
use crate::store::{ObjectStore, WatchEvent};
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pause before listing again after a failed list or a closed watch
pub const RELIST_DELAY: Duration = Duration::from_secs(1);

/// Change seen by the mirror, with the previous value for updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    Added(SnapshotRequest),
    Updated {
        old: SnapshotRequest,
        new: SnapshotRequest,
    },
    Deleted(SnapshotRequest),
}

/// Informer-style cache of snapshot requests
pub struct RequestMirror {
    store: Arc<dyn ObjectStore>,
    records: RwLock<HashMap<SnapshotKey, SnapshotRequest>>,
    synced: watch::Sender<bool>,
}

impl std::fmt::Debug for RequestMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMirror")
            .field("records", &self.len())
            .field("synced", &self.has_synced())
            .finish()
    }
}

impl RequestMirror {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            store,
            records: RwLock::new(HashMap::new()),
            synced,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SnapshotKey, SnapshotRequest>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SnapshotKey, SnapshotRequest>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn list(&self) -> Vec<SnapshotRequest> {
        self.read().values().cloned().collect()
    }

    pub fn get(&self, key: &SnapshotKey) -> Option<SnapshotRequest> {
        self.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Whether the initial full listing has completed
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub async fn wait_synced(&self) {
        let mut synced = self.synced.subscribe();
        // The sender is owned by self and cannot close while we borrow it.
        let _ = synced.wait_for(|synced| *synced).await;
    }

    /// List the store and replace the mirrored records
    ///
    /// Returns the differences to the previous contents; on the first call
    /// every request is reported as added.
    pub async fn resync(&self) -> Result<Vec<RequestEvent>> {
        let listed = self.store.list_requests().await?;

        let mut fresh = HashMap::with_capacity(listed.len());
        for request in listed {
            match request.key() {
                Ok(key) => {
                    fresh.insert(key, request);
                }
                Err(e) => warn!(error = %e, "Ignoring snapshot request with invalid key"),
            }
        }

        let mut records = self.write();
        let mut events = Vec::new();
        for (key, new) in &fresh {
            match records.get(key) {
                None => events.push(RequestEvent::Added(new.clone())),
                Some(old) if old != new => events.push(RequestEvent::Updated {
                    old: old.clone(),
                    new: new.clone(),
                }),
                Some(_) => {}
            }
        }
        for (key, old) in records.iter() {
            if !fresh.contains_key(key) {
                events.push(RequestEvent::Deleted(old.clone()));
            }
        }
        *records = fresh;
        drop(records);

        self.synced.send_replace(true);
        debug!(records = self.len(), changes = events.len(), "Mirror resynced");
        Ok(events)
    }

    /// Fold one watch notification into the mirror
    ///
    /// Returns `None` for duplicate deliveries.
    pub fn apply(&self, event: WatchEvent) -> Option<RequestEvent> {
        let key = match event.request().key() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Ignoring watch event with invalid key");
                return None;
            }
        };

        let mut records = self.write();
        match event {
            WatchEvent::Added(new) | WatchEvent::Modified(new) => {
                match records.insert(key, new.clone()) {
                    None => Some(RequestEvent::Added(new)),
                    Some(old) if old == new => None,
                    Some(old) => Some(RequestEvent::Updated { old, new }),
                }
            }
            WatchEvent::Deleted(last) => {
                let old = records.remove(&key).unwrap_or(last);
                Some(RequestEvent::Deleted(old))
            }
        }
    }

    /// Follow the store until `shutdown`, passing every change to `handler`
    pub async fn run<F>(&self, mut handler: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(RequestEvent) + Send,
    {
        loop {
            // Subscribe before listing so nothing between the two is lost.
            let mut events = self.store.watch_requests();
            match self.resync().await {
                Ok(changes) => {
                    info!(records = self.len(), "Snapshot request mirror synced");
                    changes.into_iter().for_each(&mut handler);
                }
                Err(e) => {
                    warn!(error = %e, "Listing snapshot requests failed");
                    tokio::select! {
                        _ = tokio::time::sleep(RELIST_DELAY) => continue,
                        _ = shutdown_requested(&mut shutdown) => return,
                    }
                }
            }

            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => {
                            if let Some(change) = self.apply(event) {
                                handler(change);
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Request watch lagged, listing again");
                            break;
                        }
                        Err(RecvError::Closed) => {
                            warn!("Request watch closed, listing again");
                            tokio::select! {
                                _ = tokio::time::sleep(RELIST_DELAY) => break,
                                _ = shutdown_requested(&mut shutdown) => return,
                            }
                        }
                    },
                    _ = shutdown_requested(&mut shutdown) => {
                        debug!("Request mirror stopping");
                        return;
                    }
                }
            }
        }
    }
}
