/*!
Snapshotter: drives backend plugins and owns SnapshotData records.

The Snapshotter is the only caller of plugins and the only writer of
SnapshotData records and Actual entries. Each create or delete runs in its own
tokio task after claiming the key in the [`OperationMap`]; a second trigger
for the same key while one is outstanding is dropped, not queued.

Creating a snapshot goes through a sync step first, so that a restart between
the backend call and the SnapshotData write never produces a second backend
snapshot:

1. a request whose conditions say Ready, Pending or Error is resumed from its
   bound SnapshotData;
2. a new request is matched against existing SnapshotData (by binding, then by
   back-reference) and against the backend (by the tag set recorded on the
   request before the last create attempt);
3. only then is the plugin asked to create a snapshot.

A request deleted while its snapshot is being taken or awaited takes the
snapshot with it: the create task deletes what it made once it finds the
request gone, and [`Snapshotter::collect_orphans`] sweeps up owned
SnapshotData that never reached the actual state.
*/

use crate::cache::ActualStateOfWorld;
use crate::config::ControllerConfig;
use crate::controller::shutdown_requested;
#[cfg(feature = "metrics")]
use crate::observability::{EngineMetrics, MetricsTimer};
use crate::model::{
    append_condition, simplified_status, ActualSnapshot, Condition, ConditionType,
    SimplifiedStatus, SnapshotData, SnapshotKey, SnapshotRequest, Volume, SNAPSHOT_TIMESTAMP_LABEL,
    SNAPSHOT_VOLUME_LABEL,
};
use crate::operation::{OperationKind, OperationMap};
use crate::plugin::{CreatedSnapshot, PluginRegistry, SnapshotPlugin};
use crate::store::ObjectStore;
use crate::{Result, SnapshotError};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use volsnap_retry::{
    poll_with_backoff, store_write_backoff_policy, with_custom_backoff, PollPolicy, PollState,
    RetryError,
};

/// Outcome of asking the Snapshotter to create or delete a snapshot
#[derive(Debug)]
pub enum Dispatch {
    /// A task was spawned; it resolves once the operation finished
    Started(JoinHandle<Result<()>>),
    /// Another operation holds the key; the trigger was dropped
    InProgress(OperationKind),
    /// The key is already in the actual state; nothing to create
    AlreadyExists,
    /// The record belongs to another engine instance
    NotOwned { owner: String },
}

impl Dispatch {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }

    /// Wait for a started task; other outcomes resolve immediately
    pub async fn finished(self) -> Result<()> {
        match self {
            Self::Started(handle) => handle.await.map_err(|e| {
                SnapshotError::backend("snapshotter", format!("operation task failed: {e}"))
            })?,
            _ => Ok(()),
        }
    }

    /// Label used for skip metrics and logs
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Started(_) => "started",
            Self::InProgress(_) => "in_progress",
            Self::AlreadyExists => "already_exists",
            Self::NotOwned { .. } => "not_owned",
        }
    }
}

/// Operations the reconciler triggers
#[cfg_attr(test, mockall::automock)]
pub trait SnapshotOperations: Send + Sync {
    /// Start creating the snapshot described by `request`
    fn create_snapshot(&self, request: &SnapshotRequest) -> Result<Dispatch>;

    /// Start deleting a snapshot the engine created earlier
    fn delete_snapshot(&self, actual: &ActualSnapshot) -> Result<Dispatch>;
}

struct Inner {
    instance_id: String,
    store: Arc<dyn ObjectStore>,
    plugins: PluginRegistry,
    actual: Arc<ActualStateOfWorld>,
    operations: OperationMap,
    wait_policy: PollPolicy,
    write_attempts: usize,
}

/// Creates and deletes backend snapshots, one task per operation
#[derive(Clone)]
pub struct Snapshotter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Snapshotter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshotter")
            .field("instance_id", &self.inner.instance_id)
            .field("plugins", &self.inner.plugins)
            .field("outstanding", &self.inner.operations.len())
            .finish()
    }
}

impl Snapshotter {
    pub fn new(
        config: &ControllerConfig,
        store: Arc<dyn ObjectStore>,
        plugins: PluginRegistry,
        actual: Arc<ActualStateOfWorld>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                instance_id: config.instance_id.clone(),
                store,
                plugins,
                actual,
                operations: OperationMap::new(),
                wait_policy: config.snapshot_wait.poll_policy(),
                write_attempts: config.store_write_retry_attempts,
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Outstanding operations, shared with the spawned tasks
    pub fn operations(&self) -> &OperationMap {
        &self.inner.operations
    }

    /// Start deletes for owned SnapshotData whose request no longer exists
    ///
    /// Snapshots that never became Ready (still Pending after the wait, or in
    /// Error) are not in the actual state, so the reconciler cannot see them.
    /// Returns how many deletes were started.
    pub async fn collect_orphans(&self) -> Result<usize> {
        let mut started = 0;
        for data in self.inner.store.list_data().await? {
            if data.owner() != Some(self.inner.instance_id.as_str()) {
                continue;
            }
            let key = data.spec.volume_snapshot_ref.clone();
            if self.inner.actual.exists(&key) || self.inner.operations.is_pending(&key) {
                continue;
            }
            match self.inner.store.get_request(&key).await {
                Err(e) if e.is_not_found() => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!(snapshot = %key, error = %e, "Could not look up request of SnapshotData");
                    continue;
                }
            }

            info!(snapshot = %key, data = data.name(), "SnapshotData outlived its request");
            let mut request = SnapshotRequest::new(key.namespace(), key.name(), "");
            request.spec.snapshot_data_name = Some(data.name().to_string());
            if self
                .delete_snapshot(&ActualSnapshot { request, data })?
                .is_started()
            {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Run [`Self::collect_orphans`] every `period` until shutdown
    pub async fn run_collector(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(period_ms = period.as_millis() as u64, "Orphan collector started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.collect_orphans().await {
                        Ok(0) => {}
                        Ok(started) => info!(started, "Deleting snapshots of removed requests"),
                        Err(e) => warn!(error = %e, "Orphan collection failed"),
                    }
                }
                _ = shutdown_requested(&mut shutdown) => {
                    debug!("Orphan collector shutting down");
                    break;
                }
            }
        }
    }

    fn skipped(&self, dispatch: Dispatch, key: &SnapshotKey) -> Result<Dispatch> {
        debug!(snapshot = %key, reason = dispatch.reason(), "Snapshot operation skipped");
        #[cfg(feature = "metrics")]
        EngineMetrics::global().record_skipped(dispatch.reason());
        Ok(dispatch)
    }
}

impl SnapshotOperations for Snapshotter {
    fn create_snapshot(&self, request: &SnapshotRequest) -> Result<Dispatch> {
        let key = request.key()?;

        if let Some(owner) = request.metadata.controller() {
            if owner != self.inner.instance_id {
                return self.skipped(
                    Dispatch::NotOwned {
                        owner: owner.to_string(),
                    },
                    &key,
                );
            }
        }
        if self.inner.actual.exists(&key) {
            return self.skipped(Dispatch::AlreadyExists, &key);
        }
        if request.claim_name().is_none() {
            return Err(SnapshotError::malformed(format!(
                "snapshot request {key} does not name a volume claim"
            )));
        }

        let guard = match self.inner.operations.try_start(&key, OperationKind::Create) {
            Ok(guard) => guard,
            Err(existing) => return self.skipped(Dispatch::InProgress(existing.kind), &key),
        };

        #[cfg(feature = "metrics")]
        EngineMetrics::global().record_started(OperationKind::Create.as_str());

        let inner = Arc::clone(&self.inner);
        let request = request.clone();
        let span = info_span!("create_snapshot", snapshot = %key);
        let handle = tokio::spawn(
            async move {
                let _guard = guard;
                let result = inner.sync_snapshot(&key, request).await;
                if let Err(e) = &result {
                    error!(error = %e, "Creating snapshot failed");
                    #[cfg(feature = "metrics")]
                    EngineMetrics::global().record_failed(OperationKind::Create.as_str());
                }
                result
            }
            .instrument(span),
        );
        Ok(Dispatch::Started(handle))
    }

    fn delete_snapshot(&self, actual: &ActualSnapshot) -> Result<Dispatch> {
        let key = actual.key().clone();

        if let Some(owner) = actual.data.owner() {
            if owner != self.inner.instance_id {
                return self.skipped(
                    Dispatch::NotOwned {
                        owner: owner.to_string(),
                    },
                    &key,
                );
            }
        }

        let guard = match self.inner.operations.try_start(&key, OperationKind::Delete) {
            Ok(guard) => guard,
            Err(existing) => return self.skipped(Dispatch::InProgress(existing.kind), &key),
        };

        #[cfg(feature = "metrics")]
        EngineMetrics::global().record_started(OperationKind::Delete.as_str());

        let inner = Arc::clone(&self.inner);
        let actual = actual.clone();
        let span = info_span!("delete_snapshot", snapshot = %key);
        let handle = tokio::spawn(
            async move {
                let _guard = guard;
                let result = inner.remove_snapshot(&key, &actual).await;
                if let Err(e) = &result {
                    error!(error = %e, "Deleting snapshot failed");
                    #[cfg(feature = "metrics")]
                    EngineMetrics::global().record_failed(OperationKind::Delete.as_str());
                }
                result
            }
            .instrument(span),
        );
        Ok(Dispatch::Started(handle))
    }
}

impl Inner {
    /// Run a store write under the store-write retry policy
    async fn store_write<'a, T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T>
    where
        T: Send + 'a,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send + 'a,
    {
        with_custom_backoff(
            op,
            store_write_backoff_policy(),
            self.write_attempts,
            |_attempt| {
                let write = f();
                Box::pin(async move {
                    write.await.map_err(|e| match e {
                        // Write closures re-read the record, so a lost race is retried.
                        SnapshotError::Conflict(_) => RetryError::Transient {
                            operation: op,
                            source: Box::new(e),
                        },
                        e => e.into_retry(op),
                    })
                })
            },
        )
        .await
        .map_err(SnapshotError::from_retry)
    }

    fn check_owner(&self, key: &SnapshotKey, data: &SnapshotData) -> Result<()> {
        match data.owner() {
            Some(owner) if owner != self.instance_id => Err(SnapshotError::NotOwned {
                key: key.to_string(),
                owner: owner.to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn sync_snapshot(&self, key: &SnapshotKey, request: SnapshotRequest) -> Result<()> {
        // The cached copy may predate our own status writes.
        let request = match self.store.get_request(key).await {
            Ok(latest) => latest,
            Err(e) if e.is_not_found() => {
                info!("Snapshot request no longer exists, nothing to create");
                return self.discard_unrequested(key).await;
            }
            Err(e) => {
                warn!(error = %e, "Could not refresh snapshot request, using cached copy");
                request
            }
        };

        let mut status = request.status();
        let mut request = request;
        if status == SimplifiedStatus::New {
            match self.update_snapshot_if_exists(key, request).await? {
                Some(found) => (status, request) = found,
                None => return Ok(()),
            }
        }

        match status {
            SimplifiedStatus::Ready => {
                let data = self.bound_data(key, &request).await?;
                info!(data = data.name(), "Snapshot is ready, adding it to the actual state");
                self.actual.add(ActualSnapshot { request, data });
                Ok(())
            }
            SimplifiedStatus::Pending => {
                let data = self.bound_data(key, &request).await?;
                self.wait_for_snapshot(key, data).await
            }
            SimplifiedStatus::Error => Err(SnapshotError::backend(
                "snapshotter",
                format!("snapshot {key} is in error state"),
            )),
            SimplifiedStatus::New => self.create_new(key, request).await,
        }
    }

    async fn bound_data(
        &self,
        key: &SnapshotKey,
        request: &SnapshotRequest,
    ) -> Result<SnapshotData> {
        let name = request.snapshot_data_name().ok_or_else(|| {
            SnapshotError::malformed(format!(
                "snapshot request {key} has conditions but no bound SnapshotData"
            ))
        })?;
        let data = self.store.get_data(name).await?;
        self.check_owner(key, &data)?;
        Ok(data)
    }

    /// Find evidence of an earlier create attempt for a request with no conditions
    ///
    /// `None` means the request disappeared while adopting what was found.
    async fn update_snapshot_if_exists(
        &self,
        key: &SnapshotKey,
        request: SnapshotRequest,
    ) -> Result<Option<(SimplifiedStatus, SnapshotRequest)>> {
        if let Some(name) = request.snapshot_data_name() {
            match self.store.get_data(name).await {
                Ok(data) => {
                    self.check_owner(key, &data)?;
                    info!(data = name, "Adopting bound SnapshotData");
                    return Ok(self
                        .bind_or_discard(key, &request, &data)
                        .await?
                        .map(|request| (recovered_status(&data), request)));
                }
                Err(e) if e.is_not_found() => {
                    warn!(data = name, "Bound SnapshotData is missing");
                }
                Err(e) => return Err(e),
            }
        }

        let existing = self
            .store
            .list_data()
            .await?
            .into_iter()
            .find(|data| &data.spec.volume_snapshot_ref == key);
        if let Some(data) = existing {
            self.check_owner(key, &data)?;
            info!(data = data.name(), "Adopting SnapshotData referencing this request");
            return Ok(self
                .bind_or_discard(key, &request, &data)
                .await?
                .map(|request| (recovered_status(&data), request)));
        }

        let Some(tags) = request.backend_tags() else {
            debug!("No earlier create attempt recorded");
            return Ok(Some((SimplifiedStatus::New, request)));
        };
        let volume = match request.metadata.labels.get(SNAPSHOT_VOLUME_LABEL) {
            Some(volume_name) => self.store.get_volume(volume_name).await?,
            None => self.resolve_volume(key, &request).await?,
        };
        let plugin = self.plugins.get(volume.source.kind())?;

        match plugin.find_snapshot(&tags).await {
            Ok(Some(found)) => {
                info!(source = found.source.id(), "Found backend snapshot by tags");
                let data = self.persist_data(key, &volume, found).await?;
                Ok(self
                    .bind_or_discard(key, &request, &data)
                    .await?
                    .map(|request| (recovered_status(&data), request)))
            }
            Ok(None) => Ok(Some((SimplifiedStatus::New, request))),
            Err(e) => {
                warn!(error = %e, "Looking up snapshot by tags failed");
                Ok(Some((SimplifiedStatus::New, request)))
            }
        }
    }

    /// Resolve request → claim → bound volume
    async fn resolve_volume(&self, key: &SnapshotKey, request: &SnapshotRequest) -> Result<Volume> {
        let claim_name = request.claim_name().ok_or_else(|| {
            SnapshotError::malformed(format!("snapshot request {key} does not name a volume claim"))
        })?;
        let claim = match self.store.get_claim(key.namespace(), claim_name).await {
            Ok(claim) => claim,
            Err(e) if e.is_not_found() => {
                return Err(SnapshotError::source_unresolvable(format!(
                    "volume claim {}/{claim_name} does not exist",
                    key.namespace()
                )))
            }
            Err(e) => return Err(e),
        };
        let volume_name = claim.volume_name.ok_or_else(|| {
            SnapshotError::source_unresolvable(format!(
                "volume claim {}/{claim_name} is not bound",
                key.namespace()
            ))
        })?;
        match self.store.get_volume(&volume_name).await {
            Ok(volume) => Ok(volume),
            Err(e) if e.is_not_found() => Err(SnapshotError::source_unresolvable(format!(
                "volume {volume_name} does not exist"
            ))),
            Err(e) => Err(e),
        }
    }

    async fn create_new(&self, key: &SnapshotKey, request: SnapshotRequest) -> Result<()> {
        let volume = self.resolve_volume(key, &request).await?;
        let plugin = self.plugins.get(volume.source.kind())?;

        // Record the tag inputs before calling the backend so a crash after
        // the call can still find the snapshot.
        let stamp = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string();
        let (uid, timestamp, volume_name) = (
            request.metadata.uid.as_str(),
            stamp.as_str(),
            volume.name(),
        );
        let stamped = self
            .store_write("update_request", move || async move {
                let mut latest = self.current_request(key, uid).await?;
                let labels = &mut latest.metadata.labels;
                labels.insert(SNAPSHOT_TIMESTAMP_LABEL.to_string(), timestamp.to_string());
                labels.insert(SNAPSHOT_VOLUME_LABEL.to_string(), volume_name.to_string());
                self.store.update_request(latest).await
            })
            .await;
        let request = match stamped {
            Ok(request) => request,
            Err(e) if e.is_not_found() => {
                info!("Snapshot request was deleted before the backend call");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let tags = request.backend_tags().ok_or_else(|| {
            SnapshotError::malformed(format!("snapshot request {key} has no uid"))
        })?;

        info!(volume = volume.name(), backend = %plugin.kind(), "Creating backend snapshot");
        let created = self.take_snapshot(plugin.as_ref(), &volume, &tags).await?;

        let data = self.persist_data(key, &volume, created).await?;
        if self.bind_or_discard(key, &request, &data).await?.is_none() {
            return Ok(());
        }

        match data.status() {
            SimplifiedStatus::Ready => {
                self.add_actual(key, data).await;
                Ok(())
            }
            SimplifiedStatus::Error => Err(failure_from(&data)),
            _ => self.wait_for_snapshot(key, data).await,
        }
    }

    async fn take_snapshot(
        &self,
        plugin: &dyn SnapshotPlugin,
        volume: &Volume,
        tags: &crate::model::SnapshotTags,
    ) -> Result<CreatedSnapshot> {
        #[cfg(feature = "metrics")]
        let timer = MetricsTimer::start();
        let result = plugin.snapshot_create(volume, tags).await;
        #[cfg(feature = "metrics")]
        timer.finish();
        result
    }

    /// Write a SnapshotData for a backend snapshot, owned by this instance
    async fn persist_data(
        &self,
        key: &SnapshotKey,
        volume: &Volume,
        created: CreatedSnapshot,
    ) -> Result<SnapshotData> {
        let mut data = SnapshotData::new(
            key.clone(),
            volume.name(),
            created.source,
            self.instance_id.clone(),
        );
        let initial = created
            .conditions
            .last()
            .cloned()
            .map(|c| Condition::new(c.condition_type, c.status, c.reason, c.message))
            .unwrap_or_else(|| Condition::pending("Snapshot creation requested"));
        data.record_condition(initial);

        let data = self
            .store_write("create_data", || self.store.create_data(data.clone()))
            .await?;
        info!(data = data.name(), "Persisted SnapshotData");
        Ok(data)
    }

    /// Latest stored copy of the request an operation started from
    ///
    /// A request deleted and re-created under the same key is a different
    /// request and reads as not found.
    async fn current_request(&self, key: &SnapshotKey, uid: &str) -> Result<SnapshotRequest> {
        let latest = self.store.get_request(key).await?;
        if !uid.is_empty() && latest.metadata.uid != uid {
            return Err(SnapshotError::not_found(format!(
                "snapshot request {key} with uid {uid}"
            )));
        }
        Ok(latest)
    }

    /// Point the request at `data` and mirror its conditions
    ///
    /// Applied to a fresh read on every attempt so concurrent edits of the
    /// request survive.
    async fn bind(
        &self,
        key: &SnapshotKey,
        request: &SnapshotRequest,
        data: &SnapshotData,
    ) -> Result<SnapshotRequest> {
        let uid = request.metadata.uid.as_str();
        self.store_write("update_request", move || async move {
            let mut latest = self.current_request(key, uid).await?;
            let mut changed = latest.snapshot_data_name() != Some(data.name());
            latest.spec.snapshot_data_name = Some(data.name().to_string());
            for condition in &data.status.conditions {
                changed |= append_condition(&mut latest.status.conditions, condition.clone());
            }
            if !changed {
                return Ok(latest);
            }
            debug!(data = data.name(), "Binding request to SnapshotData");
            self.store.update_request(latest).await
        })
        .await
    }

    /// [`Self::bind`], deleting the snapshot if the request is gone
    async fn bind_or_discard(
        &self,
        key: &SnapshotKey,
        request: &SnapshotRequest,
        data: &SnapshotData,
    ) -> Result<Option<SnapshotRequest>> {
        match self.bind(key, request, data).await {
            Ok(bound) => Ok(Some(bound)),
            Err(e) if e.is_not_found() => {
                info!(data = data.name(), "Request was deleted meanwhile, discarding snapshot");
                self.destroy(key, data).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn request_deleted(&self, key: &SnapshotKey) -> bool {
        matches!(self.store.get_request(key).await, Err(e) if e.is_not_found())
    }

    /// Delete owned SnapshotData left behind for a request that is gone
    async fn discard_unrequested(&self, key: &SnapshotKey) -> Result<()> {
        let leftovers = self
            .store
            .list_data()
            .await?
            .into_iter()
            .filter(|data| {
                &data.spec.volume_snapshot_ref == key
                    && data.owner() == Some(self.instance_id.as_str())
            });
        for data in leftovers {
            info!(data = data.name(), "Discarding snapshot of deleted request");
            self.destroy(key, &data).await?;
        }
        Ok(())
    }

    /// Append `condition` to the SnapshotData and mirror it on the request
    async fn propagate_condition(
        &self,
        key: &SnapshotKey,
        data_name: &str,
        condition: &Condition,
    ) -> Result<SnapshotData> {
        let data = self
            .store_write("update_data", move || async move {
                let mut data = self.store.get_data(data_name).await?;
                if data.record_condition(condition.clone()) {
                    self.store.update_data(data).await
                } else {
                    Ok(data)
                }
            })
            .await?;

        let mirrored = self
            .store_write("update_request", move || async move {
                let mut request = self.store.get_request(key).await?;
                if append_condition(&mut request.status.conditions, condition.clone()) {
                    self.store.update_request(request).await.map(|_| ())
                } else {
                    Ok(())
                }
            })
            .await;
        if let Err(e) = mirrored {
            warn!(error = %e, "Could not mirror condition onto the request");
        }
        Ok(data)
    }

    /// Wait for a Pending snapshot; discard it if its request went away meanwhile
    async fn wait_for_snapshot(&self, key: &SnapshotKey, data: SnapshotData) -> Result<()> {
        let result = self.await_ready(key, data.clone()).await;
        if result.is_err() && self.request_deleted(key).await {
            info!(data = data.name(), "Request was deleted while waiting, discarding snapshot");
            return self.destroy(key, &data).await;
        }
        result
    }

    /// Poll the backend until a Pending snapshot is Ready or failed
    async fn await_ready(&self, key: &SnapshotKey, data: SnapshotData) -> Result<()> {
        let plugin = self.plugins.get(data.spec.source.kind())?;
        let data_name = data.name().to_string();

        let description = poll_with_backoff("wait_for_snapshot", &self.wait_policy, |attempt| {
            let plugin = Arc::clone(&plugin);
            let data = &data;
            let data_name = &data_name;
            Box::pin(async move {
                debug!(attempt, "Describing snapshot");
                let described = plugin
                    .describe_snapshot(data)
                    .await
                    .map_err(|e| e.into_retry("describe_snapshot"))?;
                if described.complete {
                    return Ok(PollState::Ready(described));
                }
                if let Some(condition) = described.conditions.last() {
                    self.propagate_condition(key, data_name, condition)
                        .await
                        .map_err(|e| e.into_retry("propagate_condition"))?;
                }
                Ok(PollState::Pending)
            })
        })
        .await
        .map_err(SnapshotError::from_retry)?;

        let data = match description.conditions.last() {
            Some(condition) => self.propagate_condition(key, &data_name, condition).await?,
            None => data,
        };

        match simplified_status(&data.status.conditions) {
            SimplifiedStatus::Ready => {
                info!(data = data.name(), "Snapshot is ready");
                self.add_actual(key, data).await;
                Ok(())
            }
            _ => Err(failure_from(&data)),
        }
    }

    async fn add_actual(&self, key: &SnapshotKey, data: SnapshotData) {
        let request = match self.store.get_request(key).await {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Using minimal request for actual state entry");
                let mut request = SnapshotRequest::new(key.namespace(), key.name(), "");
                request.spec.snapshot_data_name = Some(data.name().to_string());
                request
            }
        };
        self.actual.add(ActualSnapshot { request, data });
    }

    async fn remove_snapshot(&self, key: &SnapshotKey, actual: &ActualSnapshot) -> Result<()> {
        self.destroy(key, &actual.data).await?;
        info!("Snapshot deleted");
        Ok(())
    }

    /// Delete the backend snapshot and its SnapshotData, then forget the key
    async fn destroy(&self, key: &SnapshotKey, data: &SnapshotData) -> Result<()> {
        let source = &data.spec.source;
        let plugin = self.plugins.get(source.kind())?;

        info!(source = source.id(), backend = %plugin.kind(), "Deleting backend snapshot");
        #[cfg(feature = "metrics")]
        let timer = MetricsTimer::start();
        let result = plugin.snapshot_delete(source).await;
        #[cfg(feature = "metrics")]
        timer.finish();
        result?;

        let data_name = data.name();
        match self
            .store_write("delete_data", || self.store.delete_data(data_name))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(data = data_name, "SnapshotData already gone"),
            Err(e) => return Err(e),
        }

        self.actual.delete(key);
        Ok(())
    }
}

/// Status to resume from when adopting existing SnapshotData
fn recovered_status(data: &SnapshotData) -> SimplifiedStatus {
    match data.status() {
        // No conditions yet: ask the backend.
        SimplifiedStatus::New => SimplifiedStatus::Pending,
        status => status,
    }
}

fn failure_from(data: &SnapshotData) -> SnapshotError {
    let message = data
        .status
        .conditions
        .last()
        .filter(|c| c.condition_type == ConditionType::Error)
        .map(|c| format!("{}: {}", c.reason, c.message))
        .unwrap_or_else(|| "snapshot did not become ready".to_string());
    SnapshotError::rejected(data.spec.source.kind().as_str(), message)
}
