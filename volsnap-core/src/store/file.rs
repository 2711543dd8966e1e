/*!
Object store persisted as one JSON file per record.

Layout under the state directory:

```text
requests/<namespace>/<name>.json
data/<name>.json
claims/<namespace>/<name>.json
volumes/<name>.json
```

Request notifications are produced by periodically diffing the `requests`
tree, so edits made by other processes (the CLI, a text editor) are observed
the same way as writes made through this handle.
*/

use super::{check_version, ensure_uid, ObjectStore, WatchEvent, WATCH_CHANNEL_CAPACITY};
use crate::model::{SnapshotData, SnapshotKey, SnapshotRequest, Volume, VolumeClaim};
use crate::{Result, SnapshotError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const REQUESTS_DIR: &str = "requests";
const DATA_DIR: &str = "data";
const CLAIMS_DIR: &str = "claims";
const VOLUMES_DIR: &str = "volumes";

/// Default interval between scans of the requests tree
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    events: broadcast::Sender<WatchEvent>,
    watch_interval: Duration,
    watcher: Mutex<Option<JoinHandle<()>>>,
    // Serializes read-modify-write sequences from this process.
    write_lock: tokio::sync::Mutex<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let watcher = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = watcher.take() {
            handle.abort();
        }
    }
}

/// File-backed object store rooted at a state directory
#[derive(Debug, Clone)]
pub struct FileObjectStore {
    inner: Arc<Inner>,
}

impl FileObjectStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_watch_interval(root, DEFAULT_WATCH_INTERVAL)
    }

    pub fn with_watch_interval(root: impl AsRef<Path>, watch_interval: Duration) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [REQUESTS_DIR, DATA_DIR, CLAIMS_DIR, VOLUMES_DIR] {
            std::fs::create_dir_all(root.join(dir)).map_err(|e| {
                SnapshotError::store(format!(
                    "Failed to create {}: {e}",
                    root.join(dir).display()
                ))
            })?;
        }
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                events,
                watch_interval,
                watcher: Mutex::new(None),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn request_path(&self, key: &SnapshotKey) -> Result<PathBuf> {
        check_file_name(key.namespace())?;
        check_file_name(key.name())?;
        Ok(self
            .inner
            .root
            .join(REQUESTS_DIR)
            .join(key.namespace())
            .join(format!("{}.json", key.name())))
    }

    fn data_path(&self, name: &str) -> Result<PathBuf> {
        check_file_name(name)?;
        Ok(self.inner.root.join(DATA_DIR).join(format!("{name}.json")))
    }

    fn claim_path(&self, namespace: &str, name: &str) -> Result<PathBuf> {
        check_file_name(namespace)?;
        check_file_name(name)?;
        Ok(self
            .inner
            .root
            .join(CLAIMS_DIR)
            .join(namespace)
            .join(format!("{name}.json")))
    }

    fn volume_path(&self, name: &str) -> Result<PathBuf> {
        check_file_name(name)?;
        Ok(self
            .inner
            .root
            .join(VOLUMES_DIR)
            .join(format!("{name}.json")))
    }

    /// Start the directory scanner the first time someone watches
    fn ensure_watcher(&self) {
        let mut watcher = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() {
            return;
        }

        let baseline = match scan_requests(&self.inner.root) {
            Ok(requests) => requests,
            Err(e) => {
                warn!(error = %e, "Initial scan of snapshot requests failed");
                HashMap::new()
            }
        };
        let weak = Arc::downgrade(&self.inner);
        *watcher = Some(tokio::spawn(watch_loop(weak, baseline)));
    }
}

async fn watch_loop(inner: Weak<Inner>, mut seen: HashMap<SnapshotKey, SnapshotRequest>) {
    let Some(interval) = inner.upgrade().map(|inner| inner.watch_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        let root = inner.root.clone();
        let scanned = match tokio::task::spawn_blocking(move || scan_requests(&root)).await {
            Ok(Ok(requests)) => requests,
            Ok(Err(e)) => {
                warn!(error = %e, "Scanning snapshot requests failed");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Snapshot request scanner task failed");
                continue;
            }
        };

        for event in diff_requests(&seen, &scanned) {
            debug!(snapshot = %event.request().metadata.name, "Request change observed on disk");
            let _ = inner.events.send(event);
        }
        seen = scanned;
    }
}

/// Events turning `before` into `after`
pub(crate) fn diff_requests(
    before: &HashMap<SnapshotKey, SnapshotRequest>,
    after: &HashMap<SnapshotKey, SnapshotRequest>,
) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    for (key, request) in after {
        match before.get(key) {
            None => events.push(WatchEvent::Added(request.clone())),
            Some(previous) if previous != request => {
                events.push(WatchEvent::Modified(request.clone()))
            }
            Some(_) => {}
        }
    }
    for (key, request) in before {
        if !after.contains_key(key) {
            events.push(WatchEvent::Deleted(request.clone()));
        }
    }
    events
}

fn check_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(SnapshotError::malformed(format!(
            "'{name}' cannot be used as a record name"
        )));
    }
    Ok(())
}

fn scan_requests(root: &Path) -> Result<HashMap<SnapshotKey, SnapshotRequest>> {
    let mut requests = HashMap::new();
    let dir = root.join(REQUESTS_DIR);
    for namespace in std::fs::read_dir(&dir)? {
        let namespace = namespace?;
        if !namespace.file_type()?.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(namespace.path())? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_record_sync::<SnapshotRequest>(&path) {
                Ok(request) => match request.key() {
                    Ok(key) => {
                        requests.insert(key, request);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping request"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable request"),
            }
        }
    }
    Ok(requests)
}

fn read_record_sync<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

fn scan_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        match read_record_sync(&path) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
        }
    }
    Ok(records)
}

async fn read_record<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(SnapshotError::not_found(what.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Write via a temporary file and rename so readers never see partial JSON
async fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_record(path: &Path, what: &str) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(SnapshotError::not_found(what.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn list_blocking<T, F>(f: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<Vec<T>> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SnapshotError::store(format!("listing task failed: {e}")))?
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn list_requests(&self) -> Result<Vec<SnapshotRequest>> {
        let root = self.inner.root.clone();
        list_blocking(move || Ok(scan_requests(&root)?.into_values().collect())).await
    }

    async fn get_request(&self, key: &SnapshotKey) -> Result<SnapshotRequest> {
        read_record(&self.request_path(key)?, &format!("snapshot request {key}")).await
    }

    async fn create_request(&self, mut request: SnapshotRequest) -> Result<SnapshotRequest> {
        let key = request.key()?;
        let path = self.request_path(&key)?;
        let _guard = self.inner.write_lock.lock().await;
        if tokio::fs::try_exists(&path).await? {
            return Err(SnapshotError::Conflict(format!(
                "snapshot request {key} already exists"
            )));
        }
        ensure_uid(&mut request.metadata.uid);
        request.metadata.resource_version = 1;
        write_record(&path, &request).await?;
        Ok(request)
    }

    async fn update_request(&self, mut request: SnapshotRequest) -> Result<SnapshotRequest> {
        let key = request.key()?;
        let path = self.request_path(&key)?;
        let _guard = self.inner.write_lock.lock().await;
        let what = format!("snapshot request {key}");
        let existing: SnapshotRequest = read_record(&path, &what).await?;
        check_version(&what, &existing.metadata, &request.metadata)?;
        request.metadata.uid = existing.metadata.uid;
        request.metadata.resource_version = existing.metadata.resource_version + 1;
        write_record(&path, &request).await?;
        Ok(request)
    }

    async fn delete_request(&self, key: &SnapshotKey) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        remove_record(&self.request_path(key)?, &format!("snapshot request {key}")).await
    }

    async fn list_data(&self) -> Result<Vec<SnapshotData>> {
        let dir = self.inner.root.join(DATA_DIR);
        list_blocking(move || scan_dir(&dir)).await
    }

    async fn get_data(&self, name: &str) -> Result<SnapshotData> {
        read_record(&self.data_path(name)?, &format!("snapshot data {name}")).await
    }

    async fn create_data(&self, mut data: SnapshotData) -> Result<SnapshotData> {
        let path = self.data_path(data.name())?;
        let _guard = self.inner.write_lock.lock().await;
        if tokio::fs::try_exists(&path).await? {
            return Err(SnapshotError::Conflict(format!(
                "snapshot data {} already exists",
                data.name()
            )));
        }
        ensure_uid(&mut data.metadata.uid);
        data.metadata.resource_version = 1;
        write_record(&path, &data).await?;
        Ok(data)
    }

    async fn update_data(&self, mut data: SnapshotData) -> Result<SnapshotData> {
        let path = self.data_path(data.name())?;
        let _guard = self.inner.write_lock.lock().await;
        let what = format!("snapshot data {}", data.name());
        let existing: SnapshotData = read_record(&path, &what).await?;
        check_version(&what, &existing.metadata, &data.metadata)?;
        data.metadata.uid = existing.metadata.uid;
        data.metadata.resource_version = existing.metadata.resource_version + 1;
        write_record(&path, &data).await?;
        Ok(data)
    }

    async fn delete_data(&self, name: &str) -> Result<()> {
        let path = self.data_path(name)?;
        let _guard = self.inner.write_lock.lock().await;
        remove_record(&path, &format!("snapshot data {name}")).await
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<VolumeClaim> {
        read_record(
            &self.claim_path(namespace, name)?,
            &format!("volume claim {namespace}/{name}"),
        )
        .await
    }

    async fn put_claim(&self, mut claim: VolumeClaim) -> Result<VolumeClaim> {
        let path = self.claim_path(&claim.metadata.namespace, &claim.metadata.name)?;
        let _guard = self.inner.write_lock.lock().await;
        ensure_uid(&mut claim.metadata.uid);
        claim.metadata.resource_version += 1;
        write_record(&path, &claim).await?;
        Ok(claim)
    }

    async fn get_volume(&self, name: &str) -> Result<Volume> {
        read_record(&self.volume_path(name)?, &format!("volume {name}")).await
    }

    async fn put_volume(&self, mut volume: Volume) -> Result<Volume> {
        let path = self.volume_path(volume.name())?;
        let _guard = self.inner.write_lock.lock().await;
        ensure_uid(&mut volume.metadata.uid);
        volume.metadata.resource_version += 1;
        write_record(&path, &volume).await?;
        Ok(volume)
    }

    fn watch_requests(&self) -> broadcast::Receiver<WatchEvent> {
        let receiver = self.inner.events.subscribe();
        self.ensure_watcher();
        receiver
    }
}
