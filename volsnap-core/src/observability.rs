/*!
Observability for the volsnap engine.

- Structured logging through `tracing-subscriber` (plain or JSON)
- Prometheus metrics for snapshot operations, behind the `metrics` feature
*/

#[cfg(feature = "metrics")]
use prometheus::{Gauge, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, SnapshotError};

/// Filter directive used when `RUST_LOG` is not set
pub const DEFAULT_LOG_DIRECTIVE: &str = "volsnap=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<EngineMetrics> = OnceLock::new();

/// Metrics for snapshot operations and cache sizes
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct EngineMetrics {
    pub operations_started_total: IntCounterVec,
    pub operations_failed_total: IntCounterVec,
    pub operations_skipped_total: IntCounterVec,
    pub backend_latency_seconds: Histogram,
    pub desired_snapshots: Gauge,
    pub actual_snapshots: Gauge,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> SnapshotError {
    SnapshotError::config(format!("Failed to set up metric {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl EngineMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations_started_total = IntCounterVec::new(
            Opts::new(
                "volsnap_operations_started_total",
                "Snapshot operations dispatched to a backend",
            ),
            &["operation"],
        )
        .map_err(|e| metric_error("volsnap_operations_started_total", e))?;

        let operations_failed_total = IntCounterVec::new(
            Opts::new(
                "volsnap_operations_failed_total",
                "Snapshot operations that ended in an error",
            ),
            &["operation"],
        )
        .map_err(|e| metric_error("volsnap_operations_failed_total", e))?;

        let operations_skipped_total = IntCounterVec::new(
            Opts::new(
                "volsnap_operations_skipped_total",
                "Snapshot operations not dispatched (in progress, exists, not owned)",
            ),
            &["reason"],
        )
        .map_err(|e| metric_error("volsnap_operations_skipped_total", e))?;

        let backend_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "volsnap_backend_latency_seconds",
            "Duration of backend plugin calls in seconds",
        ))
        .map_err(|e| metric_error("volsnap_backend_latency_seconds", e))?;

        let desired_snapshots = Gauge::new(
            "volsnap_desired_snapshots",
            "Snapshots in the desired state cache",
        )
        .map_err(|e| metric_error("volsnap_desired_snapshots", e))?;

        let actual_snapshots = Gauge::new(
            "volsnap_actual_snapshots",
            "Snapshots in the actual state cache",
        )
        .map_err(|e| metric_error("volsnap_actual_snapshots", e))?;

        registry
            .register(Box::new(operations_started_total.clone()))
            .map_err(|e| metric_error("volsnap_operations_started_total", e))?;
        registry
            .register(Box::new(operations_failed_total.clone()))
            .map_err(|e| metric_error("volsnap_operations_failed_total", e))?;
        registry
            .register(Box::new(operations_skipped_total.clone()))
            .map_err(|e| metric_error("volsnap_operations_skipped_total", e))?;
        registry
            .register(Box::new(backend_latency_seconds.clone()))
            .map_err(|e| metric_error("volsnap_backend_latency_seconds", e))?;
        registry
            .register(Box::new(desired_snapshots.clone()))
            .map_err(|e| metric_error("volsnap_desired_snapshots", e))?;
        registry
            .register(Box::new(actual_snapshots.clone()))
            .map_err(|e| metric_error("volsnap_actual_snapshots", e))?;

        Ok(Self {
            operations_started_total,
            operations_failed_total,
            operations_skipped_total,
            backend_latency_seconds,
            desired_snapshots,
            actual_snapshots,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> &'static EngineMetrics {
        METRICS.get_or_init(|| match Self::new() {
            Ok(metrics) => metrics,
            // Metric names are static; failing here is a programming error.
            Err(e) => panic!("Failed to initialize volsnap metrics: {e}"),
        })
    }

    pub fn record_started(&self, operation: &str) {
        self.operations_started_total
            .with_label_values(&[operation])
            .inc();
    }

    pub fn record_failed(&self, operation: &str) {
        self.operations_failed_total
            .with_label_values(&[operation])
            .inc();
    }

    pub fn record_skipped(&self, reason: &str) {
        self.operations_skipped_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn record_cache_sizes(&self, desired: usize, actual: usize) {
        self.desired_snapshots.set(desired as f64);
        self.actual_snapshots.set(actual as f64);
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| SnapshotError::config(format!("Failed to encode metrics: {e}")))
    }
}

/// Measures one backend plugin call
#[cfg(feature = "metrics")]
pub struct MetricsTimer {
    start: Instant,
}

#[cfg(feature = "metrics")]
impl MetricsTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        EngineMetrics::global()
            .backend_latency_seconds
            .observe(self.start.elapsed().as_secs_f64());
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `default_directive`. With `json` set,
/// events are written as one JSON object per line.
pub fn init_observability(json: bool, default_directive: &str) -> Result<()> {
    #[cfg(feature = "metrics")]
    EngineMetrics::global();

    let directive = default_directive
        .parse()
        .map_err(|e| SnapshotError::config(format!("Invalid log directive: {e}")))?;
    let filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let result = if json {
        let subscriber = TracingRegistry::default().with(filter).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false),
        );
        set_global_default(subscriber)
    } else {
        let subscriber = TracingRegistry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false));
        set_global_default(subscriber)
    };

    result.map_err(|e| {
        SnapshotError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("volsnap observability initialized");
    Ok(())
}

/// Plain-text logging at `volsnap=info`
pub fn init_default_observability() -> Result<()> {
    init_observability(false, DEFAULT_LOG_DIRECTIVE)
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = EngineMetrics::global();
        metrics.record_started("create");
        metrics.record_failed("create");
        metrics.record_skipped("in_progress");
        metrics.record_cache_sizes(3, 2);

        let timer = MetricsTimer::start();
        timer.finish();

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("volsnap_operations_started_total"));
        assert!(text.contains("volsnap_desired_snapshots 3"));
    }
}
