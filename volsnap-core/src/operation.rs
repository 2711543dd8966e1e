//! In-flight operation tracking
//!
//! At most one create or delete may be outstanding per snapshot key. A caller
//! that wins [`OperationMap::try_start`] holds an [`OperationGuard`]; the
//! record disappears when the guard is dropped, whether the task finished,
//! failed or panicked. Losers get the kind of the operation already running.

use crate::model::SnapshotKey;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

/// Kind of backend operation in flight for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Shared {
    records: Mutex<HashMap<SnapshotKey, OperationRecord>>,
    outstanding: watch::Sender<usize>,
}

/// Map of outstanding operations, shared between clones
#[derive(Debug, Clone)]
pub struct OperationMap {
    shared: Arc<Shared>,
}

impl Default for OperationMap {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationMap {
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                records: Mutex::new(HashMap::new()),
                outstanding,
            }),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<SnapshotKey, OperationRecord>> {
        self.shared
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `key` for an operation of `kind`
    ///
    /// Returns the record of the operation already running if the key is taken.
    pub fn try_start(
        &self,
        key: &SnapshotKey,
        kind: OperationKind,
    ) -> std::result::Result<OperationGuard, OperationRecord> {
        let mut records = self.records();
        if let Some(existing) = records.get(key) {
            return Err(*existing);
        }
        records.insert(
            key.clone(),
            OperationRecord {
                kind,
                started_at: Utc::now(),
            },
        );
        self.shared.outstanding.send_replace(records.len());
        debug!(snapshot = %key, operation = %kind, "Operation started");

        Ok(OperationGuard {
            map: self.clone(),
            key: key.clone(),
            kind,
        })
    }

    pub fn get(&self, key: &SnapshotKey) -> Option<OperationRecord> {
        self.records().get(key).copied()
    }

    pub fn is_pending(&self, key: &SnapshotKey) -> bool {
        self.records().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Wait until no operation is outstanding
    pub async fn wait_idle(&self) {
        let mut outstanding = self.shared.outstanding.subscribe();
        // The sender is owned by `shared`, which outlives this borrow.
        let _ = outstanding.wait_for(|count| *count == 0).await;
    }

    fn finish(&self, key: &SnapshotKey, kind: OperationKind) {
        let mut records = self.records();
        records.remove(key);
        self.shared.outstanding.send_replace(records.len());
        debug!(snapshot = %key, operation = %kind, "Operation finished");
    }
}

/// Ownership of a key's operation slot; releases it on drop
#[derive(Debug)]
pub struct OperationGuard {
    map: OperationMap,
    key: SnapshotKey,
    kind: OperationKind,
}

impl OperationGuard {
    pub fn key(&self) -> &SnapshotKey {
        &self.key
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.map.finish(&self.key, self.kind);
    }
}
