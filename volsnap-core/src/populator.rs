//! Periodic re-population of the desired state from the request mirror
//!
//! Watch notifications can be missed; this loop closes the gap by re-adding
//! every mirrored request. It never removes anything from the desired state.

use crate::cache::DesiredStateOfWorld;
use crate::controller::shutdown_requested;
use crate::mirror::RequestMirror;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct DesiredStatePopulator {
    mirror: Arc<RequestMirror>,
    desired: Arc<DesiredStateOfWorld>,
    period: Duration,
}

impl DesiredStatePopulator {
    pub fn new(
        mirror: Arc<RequestMirror>,
        desired: Arc<DesiredStateOfWorld>,
        period: Duration,
    ) -> Self {
        Self {
            mirror,
            desired,
            period,
        }
    }

    /// Add every mirrored request to the desired state; returns how many were new
    pub fn populate(&self) -> usize {
        let mut added = 0;
        for request in self.mirror.list() {
            let known = request
                .key()
                .map(|key| self.desired.exists(&key))
                .unwrap_or(false);
            match self.desired.add(&request) {
                Ok(()) if !known => added += 1,
                Ok(()) => {}
                Err(e) => warn!(error = %e, "Skipping snapshot request"),
            }
        }
        if added > 0 {
            info!(added, "Populator found requests missing from the desired state");
        }
        added
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(period_ms = self.period.as_millis() as u64, "Populator started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.populate();
                }
                _ = shutdown_requested(&mut shutdown) => {
                    debug!("Populator shutting down");
                    break;
                }
            }
        }
    }
}
