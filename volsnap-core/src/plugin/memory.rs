/*!
In-process backend for development and tests.

Keeps snapshots in a map and counts every call. Failures, latency and
asynchronous (Pending first) snapshots can be injected to exercise the
engine's retry and wait paths.
*/

use super::{CreatedSnapshot, SnapshotDescription, SnapshotPlugin};
use crate::config::BackendConfig;
use crate::model::{
    BackendKind, Condition, SnapshotData, SnapshotSource, SnapshotTags, Volume, VolumeSource,
};
use crate::{Result, SnapshotError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// How an injected failure is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// [`SnapshotError::Backend`], retried on the next tick
    Transient,
    /// [`SnapshotError::Rejected`]
    Permanent,
}

impl FailureMode {
    fn error(self, message: &str) -> SnapshotError {
        match self {
            Self::Transient => SnapshotError::backend(BackendKind::Memory.as_str(), message),
            Self::Permanent => SnapshotError::rejected(BackendKind::Memory.as_str(), message),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    tags: SnapshotTags,
    describes: usize,
}

#[derive(Debug, Default)]
struct State {
    snapshots: HashMap<String, StoredSnapshot>,
    deleted_volumes: Vec<String>,
    create_failures: Option<(usize, FailureMode)>,
    delete_failures: Option<(usize, FailureMode)>,
    latency: Duration,
    /// Describes needed before a snapshot turns Ready; `None` means Ready at once
    pending_describes: Option<usize>,
}

/// Call counters of a [`MemoryPlugin`]
#[derive(Debug, Default)]
pub struct CallCounts {
    pub create: AtomicUsize,
    pub delete: AtomicUsize,
    pub describe: AtomicUsize,
    pub find: AtomicUsize,
    pub volume_delete: AtomicUsize,
}

/// Backend keeping snapshots in memory
#[derive(Debug)]
pub struct MemoryPlugin {
    state: Mutex<State>,
    calls: CallCounts,
    paused: watch::Sender<bool>,
}

impl Default for MemoryPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlugin {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Mutex::new(State::default()),
            calls: CallCounts::default(),
            paused,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` creates
    pub fn fail_creates(&self, count: usize, mode: FailureMode) {
        self.lock().create_failures = Some((count, mode));
    }

    /// Fail the next `count` deletes
    pub fn fail_deletes(&self, count: usize, mode: FailureMode) {
        self.lock().delete_failures = Some((count, mode));
    }

    /// Delay every backend call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Return Pending from create until a snapshot has been described `describes` times
    pub fn complete_after_describes(&self, describes: usize) {
        self.lock().pending_describes = Some(describes);
    }

    /// Hold creates and deletes until [`MemoryPlugin::resume`]
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    pub fn create_calls(&self) -> usize {
        self.calls.create.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.calls.delete.load(Ordering::SeqCst)
    }

    /// Number of snapshots currently held
    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    pub fn contains(&self, snapshot_id: &str) -> bool {
        self.lock().snapshots.contains_key(snapshot_id)
    }

    pub fn deleted_volumes(&self) -> Vec<String> {
        self.lock().deleted_volumes.clone()
    }

    async fn simulate_call(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut paused = self.paused.subscribe();
        // The sender lives in self, so wait_for cannot observe a closed channel.
        let _ = paused.wait_for(|paused| !*paused).await;
    }

    fn take_failure(slot: &mut Option<(usize, FailureMode)>) -> Option<FailureMode> {
        let (remaining, mode) = slot.as_mut()?;
        if *remaining == 0 {
            *slot = None;
            return None;
        }
        *remaining -= 1;
        Some(*mode)
    }

    fn snapshot_id(source: &SnapshotSource) -> Result<&str> {
        match source {
            SnapshotSource::Memory { snapshot_id } => Ok(snapshot_id),
            other => Err(SnapshotError::rejected(
                BackendKind::Memory.as_str(),
                format!("not a memory snapshot: {}", other.kind()),
            )),
        }
    }

    fn conditions_for(snapshot: &StoredSnapshot, pending_describes: Option<usize>) -> Condition {
        match pending_describes {
            Some(needed) if snapshot.describes < needed => {
                Condition::pending("Snapshot is being uploaded")
            }
            _ => Condition::ready("Snapshot created successfully"),
        }
    }
}

#[async_trait]
impl SnapshotPlugin for MemoryPlugin {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn init(&self, provider: &BackendConfig) -> Result<()> {
        match provider {
            BackendConfig::Memory => Ok(()),
            _ => Err(SnapshotError::config(
                "memory plugin needs a memory backend configuration",
            )),
        }
    }

    async fn snapshot_create(
        &self,
        volume: &Volume,
        tags: &SnapshotTags,
    ) -> Result<CreatedSnapshot> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await;

        if !matches!(volume.source, VolumeSource::Memory { .. }) {
            return Err(SnapshotError::rejected(
                BackendKind::Memory.as_str(),
                format!("volume {} is not a memory volume", volume.name()),
            ));
        }

        let mut state = self.lock();
        if let Some(mode) = Self::take_failure(&mut state.create_failures) {
            return Err(mode.error("injected create failure"));
        }

        let snapshot_id = format!("mem-{}", uuid::Uuid::new_v4());
        let stored = StoredSnapshot {
            tags: tags.clone(),
            describes: 0,
        };
        let condition = Self::conditions_for(&stored, state.pending_describes);
        state.snapshots.insert(snapshot_id.clone(), stored);

        Ok(CreatedSnapshot {
            source: SnapshotSource::Memory { snapshot_id },
            conditions: vec![condition],
        })
    }

    async fn snapshot_delete(&self, source: &SnapshotSource) -> Result<()> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await;
        let snapshot_id = Self::snapshot_id(source)?;

        let mut state = self.lock();
        if let Some(mode) = Self::take_failure(&mut state.delete_failures) {
            return Err(mode.error("injected delete failure"));
        }
        state.snapshots.remove(snapshot_id);
        Ok(())
    }

    async fn describe_snapshot(&self, data: &SnapshotData) -> Result<SnapshotDescription> {
        self.calls.describe.fetch_add(1, Ordering::SeqCst);
        let snapshot_id = Self::snapshot_id(&data.spec.source)?;

        let mut state = self.lock();
        let pending_describes = state.pending_describes;
        let Some(snapshot) = state.snapshots.get_mut(snapshot_id) else {
            return Ok(SnapshotDescription {
                conditions: vec![Condition::error(
                    "SnapshotMissing",
                    format!("snapshot {snapshot_id} does not exist"),
                )],
                complete: true,
            });
        };
        snapshot.describes += 1;
        let condition = Self::conditions_for(snapshot, pending_describes);
        let complete = crate::model::simplified_status(std::slice::from_ref(&condition))
            != crate::model::SimplifiedStatus::Pending;

        Ok(SnapshotDescription {
            conditions: vec![condition],
            complete,
        })
    }

    async fn find_snapshot(&self, tags: &SnapshotTags) -> Result<Option<CreatedSnapshot>> {
        self.calls.find.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        let found = state
            .snapshots
            .iter()
            .find(|(_, snapshot)| &snapshot.tags == tags)
            .map(|(snapshot_id, snapshot)| CreatedSnapshot {
                source: SnapshotSource::Memory {
                    snapshot_id: snapshot_id.clone(),
                },
                conditions: vec![Self::conditions_for(snapshot, state.pending_describes)],
            });
        Ok(found)
    }

    async fn volume_delete(&self, volume: &Volume) -> Result<()> {
        self.calls.volume_delete.fetch_add(1, Ordering::SeqCst);
        self.lock().deleted_volumes.push(volume.name().to_string());
        Ok(())
    }
}
