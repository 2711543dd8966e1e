//! Configuration for the snapshot controller
//!
//! Loop periods, the asynchronous-snapshot wait schedule, object-store write
//! retries and the backend selection. Values can come from a JSON file or be
//! built programmatically; the CLI overlays flags on top.

use crate::{Result, SnapshotError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use volsnap_retry::PollPolicy;

/// Backend the controller registers at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BackendConfig {
    /// Archive host directories into `archive_dir`
    HostPath { archive_dir: PathBuf },
    /// In-process backend, state is lost on exit
    Memory,
}

/// Schedule for polling a Pending snapshot until it becomes Ready
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotWaitConfig {
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub steps: usize,
    /// Upper bound on any single sleep between polls
    pub max_delay_ms: u64,
}

impl Default for SnapshotWaitConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            factor: 1.5,
            steps: 20,
            max_delay_ms: 300_000,
        }
    }
}

impl SnapshotWaitConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            self.factor,
            self.steps,
        )
        .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

/// Top-level controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Identity of this engine instance, stamped on every SnapshotData it creates
    pub instance_id: String,
    pub reconciler_loop_period_ms: u64,
    /// Period of the slow full-sync hook
    pub sync_period_ms: u64,
    pub disable_reconciliation_sync: bool,
    pub populator_loop_period_ms: u64,
    /// Period of the sweep that deletes snapshots whose request is gone
    pub collector_loop_period_ms: u64,
    pub snapshot_wait: SnapshotWaitConfig,
    /// Attempts for each SnapshotData / request write
    pub store_write_retry_attempts: usize,
    pub backend: BackendConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            instance_id: "volsnap".to_string(),
            reconciler_loop_period_ms: 100,
            sync_period_ms: 60_000,
            disable_reconciliation_sync: false,
            populator_loop_period_ms: 60_000,
            collector_loop_period_ms: 60_000,
            snapshot_wait: SnapshotWaitConfig::default(),
            store_write_retry_attempts: 5,
            backend: BackendConfig::Memory,
        }
    }
}

impl ControllerConfig {
    /// Default configuration archiving host-path volumes into `archive_dir`
    pub fn host_path(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::HostPath {
                archive_dir: archive_dir.into(),
            },
            ..Self::default()
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SnapshotError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            SnapshotError::config(format!("Invalid configuration in {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_id.trim().is_empty() {
            return Err(SnapshotError::config("instance_id must not be empty"));
        }
        if self.reconciler_loop_period_ms == 0 {
            return Err(SnapshotError::config(
                "reconciler_loop_period_ms must be greater than zero",
            ));
        }
        if self.populator_loop_period_ms == 0 {
            return Err(SnapshotError::config(
                "populator_loop_period_ms must be greater than zero",
            ));
        }
        if self.collector_loop_period_ms == 0 {
            return Err(SnapshotError::config(
                "collector_loop_period_ms must be greater than zero",
            ));
        }
        if !self.disable_reconciliation_sync && self.sync_period_ms == 0 {
            return Err(SnapshotError::config(
                "sync_period_ms must be greater than zero",
            ));
        }
        if !self.snapshot_wait.factor.is_finite() || self.snapshot_wait.factor < 1.0 {
            return Err(SnapshotError::config(
                "snapshot_wait.factor must be a finite number of at least 1.0",
            ));
        }
        if self.snapshot_wait.max_delay_ms == 0 {
            return Err(SnapshotError::config(
                "snapshot_wait.max_delay_ms must be greater than zero",
            ));
        }
        if self.snapshot_wait.steps == 0 {
            return Err(SnapshotError::config(
                "snapshot_wait.steps must be greater than zero",
            ));
        }
        if self.store_write_retry_attempts == 0 {
            return Err(SnapshotError::config(
                "store_write_retry_attempts must be greater than zero",
            ));
        }
        if let BackendConfig::HostPath { archive_dir } = &self.backend {
            if archive_dir.as_os_str().is_empty() {
                return Err(SnapshotError::config(
                    "hostPath backend requires an archive_dir",
                ));
            }
        }
        Ok(())
    }

    pub fn reconciler_period(&self) -> Duration {
        Duration::from_millis(self.reconciler_loop_period_ms)
    }

    pub fn populator_period(&self) -> Duration {
        Duration::from_millis(self.populator_loop_period_ms)
    }

    pub fn collector_period(&self) -> Duration {
        Duration::from_millis(self.collector_loop_period_ms)
    }

    /// Period of the full-sync hook, if it runs at all
    ///
    /// Disabled explicitly or when the period is below one second.
    pub fn sync_period(&self) -> Option<Duration> {
        let period = Duration::from_millis(self.sync_period_ms);
        if self.disable_reconciliation_sync || period < Duration::from_secs(1) {
            None
        } else {
            Some(period)
        }
    }
}
