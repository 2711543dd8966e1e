//! Periodic reconciliation of the desired and actual state
//!
//! Every tick compares the two caches and hands the differences to the
//! snapshotter: keys only in the actual state are deleted first, then keys
//! only in the desired state are created. Dispatch is fire-and-forget; the
//! snapshotter's operation map drops triggers for keys that are already busy,
//! so a slow backend call is simply retried on a later tick.

use crate::cache::{ActualStateOfWorld, DesiredStateOfWorld};
use crate::controller::shutdown_requested;
#[cfg(feature = "metrics")]
use crate::observability::EngineMetrics;
use crate::snapshotter::{Dispatch, SnapshotOperations};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What a single reconciliation pass dispatched
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub deletes: usize,
    pub creates: usize,
    /// Triggers dropped because the key was busy, already present or foreign
    pub skipped: usize,
    /// Triggers rejected with an error (malformed or invalid records)
    pub failed: usize,
}

impl TickSummary {
    fn count(&mut self, dispatched: &mut usize, result: crate::Result<Dispatch>) {
        match result {
            Ok(dispatch) if dispatch.is_started() => *dispatched += 1,
            Ok(_) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Drives the snapshotter from the difference between the two caches
pub struct Reconciler {
    desired: Arc<DesiredStateOfWorld>,
    actual: Arc<ActualStateOfWorld>,
    operations: Arc<dyn SnapshotOperations>,
    period: Duration,
    sync_period: Option<Duration>,
    last_full_sync: Mutex<Option<DateTime<Utc>>>,
}

impl Reconciler {
    /// `sync_period` of `None` disables the full-sync hook
    pub fn new(
        desired: Arc<DesiredStateOfWorld>,
        actual: Arc<ActualStateOfWorld>,
        operations: Arc<dyn SnapshotOperations>,
        period: Duration,
        sync_period: Option<Duration>,
    ) -> Self {
        Self {
            desired,
            actual,
            operations,
            period,
            sync_period,
            last_full_sync: Mutex::new(None),
        }
    }

    /// Run one reconciliation pass
    pub fn reconcile(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        let mut deletes = 0;
        let mut creates = 0;

        for (key, actual) in self.actual.list() {
            if self.desired.exists(&key) {
                continue;
            }
            debug!(snapshot = %key, "Snapshot no longer desired, deleting");
            let result = self.operations.delete_snapshot(&actual);
            if let Err(e) = &result {
                warn!(snapshot = %key, error = %e, "Could not start snapshot delete");
            }
            summary.count(&mut deletes, result);
        }

        for (key, request) in self.desired.list() {
            if self.actual.exists(&key) {
                continue;
            }
            debug!(snapshot = %key, "Snapshot desired but missing, creating");
            let result = self.operations.create_snapshot(&request);
            if let Err(e) = &result {
                warn!(snapshot = %key, error = %e, "Could not start snapshot create");
            }
            summary.count(&mut creates, result);
        }

        summary.deletes = deletes;
        summary.creates = creates;

        #[cfg(feature = "metrics")]
        EngineMetrics::global().record_cache_sizes(self.desired.len(), self.actual.len());

        summary
    }

    /// Full-sync hook
    ///
    /// Carries no snapshot-specific logic; the actual state is trusted once a
    /// snapshot reached it.
    pub fn full_sync(&self) {
        let now = Utc::now();
        *self
            .last_full_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(now);
        info!(
            desired = self.desired.len(),
            actual = self.actual.len(),
            "Full reconciliation sync"
        );
    }

    pub fn last_full_sync(&self) -> Option<DateTime<Utc>> {
        *self
            .last_full_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Tick until `shutdown` turns true or its sender goes away
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync = self.sync_period.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!(
            period_ms = self.period.as_millis() as u64,
            full_sync = sync.is_some(),
            "Reconciler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.reconcile();
                    if summary != TickSummary::default() {
                        debug!(?summary, "Reconciler tick");
                    }
                }
                _ = next_sync(&mut sync) => self.full_sync(),
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Reconciler shutting down");
                    break;
                }
            }
        }
    }
}

async fn next_sync(sync: &mut Option<Interval>) {
    match sync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
