/*!
Top-level snapshot controller.

Wires the request mirror, the two state caches, the populator, the
reconciler and the snapshotter together and runs them until shutdown. The
snapshotter's orphan collector runs next to the reconciler and removes
snapshots whose request was deleted before they became Ready.
Request notifications feed the desired state directly; the populator and the
reconciler only start once the mirror has completed its first full listing,
so an empty mirror is never mistaken for "nothing is desired".
*/

use crate::cache::{ActualStateOfWorld, DesiredStateOfWorld};
use crate::config::ControllerConfig;
use crate::mirror::{RequestEvent, RequestMirror};
use crate::plugin::PluginRegistry;
use crate::populator::DesiredStatePopulator;
use crate::reconciler::Reconciler;
use crate::snapshotter::Snapshotter;
use crate::store::ObjectStore;
use crate::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Resolve once `shutdown` is true or its sender is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Apply a request change to the desired state
///
/// Updates only matter when the SnapshotData binding changed; other edits
/// (labels, conditions written by the snapshotter) are ignored.
pub fn apply_request_event(desired: &DesiredStateOfWorld, event: RequestEvent) {
    match event {
        RequestEvent::Added(request) => {
            if let Err(e) = desired.add(&request) {
                warn!(error = %e, "Ignoring added snapshot request");
            }
        }
        RequestEvent::Updated { old, new } => {
            if old.snapshot_data_name() == new.snapshot_data_name() {
                return;
            }
            if let Err(e) = desired.add(&new) {
                warn!(error = %e, "Ignoring updated snapshot request");
            }
        }
        RequestEvent::Deleted(request) => match request.key() {
            Ok(key) => desired.delete(&key),
            Err(e) => warn!(error = %e, "Ignoring deleted snapshot request"),
        },
    }
}

pub struct SnapshotController {
    config: ControllerConfig,
    desired: Arc<DesiredStateOfWorld>,
    actual: Arc<ActualStateOfWorld>,
    mirror: Arc<RequestMirror>,
    snapshotter: Snapshotter,
}

impl std::fmt::Debug for SnapshotController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotController")
            .field("instance_id", &self.config.instance_id)
            .field("desired", &self.desired.len())
            .field("actual", &self.actual.len())
            .field("snapshotter", &self.snapshotter)
            .finish()
    }
}

impl SnapshotController {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn ObjectStore>,
        plugins: PluginRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let desired = Arc::new(DesiredStateOfWorld::new());
        let actual = Arc::new(ActualStateOfWorld::new());
        let mirror = Arc::new(RequestMirror::new(Arc::clone(&store)));
        let snapshotter = Snapshotter::new(&config, store, plugins, Arc::clone(&actual));

        Ok(Self {
            config,
            desired,
            actual,
            mirror,
            snapshotter,
        })
    }

    /// Build the controller with the backend named in the configuration
    pub async fn from_config(
        config: ControllerConfig,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let plugins = PluginRegistry::from_config(&config.backend).await?;
        Self::new(config, store, plugins)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn desired(&self) -> &Arc<DesiredStateOfWorld> {
        &self.desired
    }

    pub fn actual(&self) -> &Arc<ActualStateOfWorld> {
        &self.actual
    }

    pub fn mirror(&self) -> &Arc<RequestMirror> {
        &self.mirror
    }

    pub fn snapshotter(&self) -> &Snapshotter {
        &self.snapshotter
    }

    /// Run until `shutdown` turns true, then wait for dispatched operations
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let span = info_span!("controller", instance = %self.config.instance_id);
        async move {
            info!("Starting snapshot controller");

            let mirror_task = {
                let mirror = Arc::clone(&self.mirror);
                let desired = Arc::clone(&self.desired);
                let shutdown = shutdown.clone();
                tokio::spawn(
                    async move {
                        mirror
                            .run(move |event| apply_request_event(&desired, event), shutdown)
                            .await
                    }
                    .in_current_span(),
                )
            };

            let mut waiting = shutdown.clone();
            let synced = tokio::select! {
                _ = self.mirror.wait_synced() => true,
                _ = shutdown_requested(&mut waiting) => false,
            };

            let mut loops = Vec::new();
            if synced {
                info!(requests = self.mirror.len(), "Request mirror synced, starting loops");

                let populator = DesiredStatePopulator::new(
                    Arc::clone(&self.mirror),
                    Arc::clone(&self.desired),
                    self.config.populator_period(),
                );
                let reconciler = Reconciler::new(
                    Arc::clone(&self.desired),
                    Arc::clone(&self.actual),
                    Arc::new(self.snapshotter.clone()),
                    self.config.reconciler_period(),
                    self.config.sync_period(),
                );

                let populator_shutdown = shutdown.clone();
                loops.push(tokio::spawn(
                    async move { populator.run(populator_shutdown).await }.in_current_span(),
                ));
                let reconciler_shutdown = shutdown.clone();
                loops.push(tokio::spawn(
                    async move { reconciler.run(reconciler_shutdown).await }.in_current_span(),
                ));

                let collector = self.snapshotter.clone();
                let collector_period = self.config.collector_period();
                let collector_shutdown = shutdown.clone();
                loops.push(tokio::spawn(
                    async move {
                        collector
                            .run_collector(collector_period, collector_shutdown)
                            .await
                    }
                    .in_current_span(),
                ));
            }

            loops.push(mirror_task);
            for handle in loops {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Controller loop ended abnormally");
                }
            }

            let outstanding = self.snapshotter.operations().len();
            if outstanding > 0 {
                info!(outstanding, "Waiting for snapshot operations to finish");
            }
            self.snapshotter.operations().wait_idle().await;
            debug!("All snapshot operations finished");

            info!("Snapshot controller stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
