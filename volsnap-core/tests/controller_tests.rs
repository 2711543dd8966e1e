/*!
End-to-end tests running the full controller against real stores and backends.
*/

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use volsnap_core::{
    ControllerConfig, MemoryObjectStore, MemoryPlugin, ObjectStore, PluginRegistry,
    SimplifiedStatus, SnapshotController, SnapshotKey, SnapshotRequest, Volume, VolumeClaim,
    VolumeSource,
};

const DEADLINE: Duration = Duration::from_secs(20);

fn fast_config(instance_id: &str) -> ControllerConfig {
    let mut config = ControllerConfig::default().with_instance_id(instance_id);
    config.reconciler_loop_period_ms = 20;
    config.populator_loop_period_ms = 200;
    config.collector_loop_period_ms = 100;
    config.disable_reconciliation_sync = true;
    config.snapshot_wait.initial_delay_ms = 10;
    config
}

async fn wait_until_ready(store: &dyn ObjectStore, key: &SnapshotKey) -> SnapshotRequest {
    let started = Instant::now();
    loop {
        if let Ok(request) = store.get_request(key).await {
            if request.status() == SimplifiedStatus::Ready {
                return request;
            }
        }
        assert!(started.elapsed() < DEADLINE, "{key} never became ready");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn seeded_store() -> MemoryObjectStore {
    let store = MemoryObjectStore::new();
    store
        .put_claim(VolumeClaim::bound("default", "pvc-1", "pv-1"))
        .await
        .unwrap();
    store
        .put_volume(Volume::new(
            "pv-1",
            VolumeSource::Memory {
                volume_id: "vol-1".to_string(),
            },
        ))
        .await
        .unwrap();
    store
}

async fn wait_until_no_data(store: &dyn ObjectStore) {
    let started = Instant::now();
    while !store.list_data().await.unwrap().is_empty() {
        assert!(started.elapsed() < DEADLINE, "SnapshotData was never removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_controller_creates_and_deletes_snapshots() {
    let store = seeded_store().await;
    // Present before startup: picked up by the initial listing.
    store
        .create_request(SnapshotRequest::new("default", "early", "pvc-1"))
        .await
        .unwrap();

    let plugin = Arc::new(MemoryPlugin::new());
    let controller = Arc::new(
        SnapshotController::new(
            fast_config("ctrl-a"),
            Arc::new(store.clone()),
            PluginRegistry::new().with_plugin(plugin.clone()),
        )
        .unwrap(),
    );

    let (stop, shutdown) = watch::channel(false);
    let running = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run(shutdown).await })
    };

    let early = SnapshotKey::new("default", "early").unwrap();
    wait_until_ready(&store, &early).await;

    // Created while running: delivered by the watch.
    store
        .create_request(SnapshotRequest::new("default", "late", "pvc-1"))
        .await
        .unwrap();
    let late = SnapshotKey::new("default", "late").unwrap();
    let request = wait_until_ready(&store, &late).await;

    let data = store
        .get_data(request.snapshot_data_name().unwrap())
        .await
        .unwrap();
    assert_eq!(data.owner(), Some("ctrl-a"));
    assert_eq!(data.spec.volume_snapshot_ref, late);
    assert_eq!(store.list_data().await.unwrap().len(), 2);

    store.delete_request(&early).await.unwrap();
    store.delete_request(&late).await.unwrap();
    wait_until_no_data(&store).await;
    assert_eq!(plugin.snapshot_count(), 0);
    assert_eq!(plugin.create_calls(), 2);

    stop.send_replace(true);
    tokio::time::timeout(DEADLINE, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(controller.snapshotter().operations().is_empty());
    assert!(controller.actual().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restarted_controller_adopts_existing_snapshots() {
    let store = seeded_store().await;
    store
        .create_request(SnapshotRequest::new("default", "snap-1", "pvc-1"))
        .await
        .unwrap();
    let plugin = Arc::new(MemoryPlugin::new());
    let key = SnapshotKey::new("default", "snap-1").unwrap();

    for _ in 0..2 {
        let controller = SnapshotController::new(
            fast_config("ctrl-a"),
            Arc::new(store.clone()),
            PluginRegistry::new().with_plugin(plugin.clone()),
        )
        .unwrap();
        let (stop, shutdown) = watch::channel(false);
        let run = controller.run(shutdown);
        let check = async {
            wait_until_ready(&store, &key).await;
            let started = Instant::now();
            while !controller.actual().exists(&key) {
                assert!(started.elapsed() < DEADLINE);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            stop.send_replace(true);
        };
        let (result, ()) = tokio::join!(run, check);
        result.unwrap();
    }

    assert_eq!(plugin.create_calls(), 1);
    assert_eq!(store.list_data().await.unwrap().len(), 1);
}

fn start_controller(
    controller: &Arc<SnapshotController>,
) -> (watch::Sender<bool>, JoinHandle<volsnap_core::Result<()>>) {
    let (stop, shutdown) = watch::channel(false);
    let controller = Arc::clone(controller);
    let running = tokio::spawn(async move { controller.run(shutdown).await });
    (stop, running)
}

async fn stop_controller(stop: watch::Sender<bool>, running: JoinHandle<volsnap_core::Result<()>>) {
    stop.send_replace(true);
    tokio::time::timeout(DEADLINE, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_deleted_while_create_outstanding() {
    let store = seeded_store().await;
    let plugin = Arc::new(MemoryPlugin::new());
    plugin.pause();
    let controller = Arc::new(
        SnapshotController::new(
            fast_config("ctrl-a"),
            Arc::new(store.clone()),
            PluginRegistry::new().with_plugin(plugin.clone()),
        )
        .unwrap(),
    );
    let (stopper, running) = start_controller(&controller);

    store
        .create_request(SnapshotRequest::new("default", "snap-1", "pvc-1"))
        .await
        .unwrap();
    let started = Instant::now();
    while plugin.create_calls() == 0 {
        assert!(started.elapsed() < DEADLINE, "create was never dispatched");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    store
        .delete_request(&SnapshotKey::new("default", "snap-1").unwrap())
        .await
        .unwrap();
    plugin.resume();

    let started = Instant::now();
    while plugin.delete_calls() == 0 {
        assert!(started.elapsed() < DEADLINE, "snapshot was never discarded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    wait_until_no_data(&store).await;
    assert_eq!(plugin.snapshot_count(), 0);
    assert_eq!(plugin.create_calls(), 1);
    stop_controller(stopper, running).await;
    assert!(controller.actual().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pending_snapshot_of_deleted_request_is_removed() {
    let store = seeded_store().await;
    let plugin = Arc::new(MemoryPlugin::new());
    plugin.complete_after_describes(1_000);
    let mut config = fast_config("ctrl-a");
    config.snapshot_wait.steps = 3;
    let controller = Arc::new(
        SnapshotController::new(
            config,
            Arc::new(store.clone()),
            PluginRegistry::new().with_plugin(plugin.clone()),
        )
        .unwrap(),
    );
    let (stopper, running) = start_controller(&controller);

    store
        .create_request(SnapshotRequest::new("default", "snap-1", "pvc-1"))
        .await
        .unwrap();
    let started = Instant::now();
    while store.list_data().await.unwrap().is_empty() {
        assert!(started.elapsed() < DEADLINE, "SnapshotData was never written");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    store
        .delete_request(&SnapshotKey::new("default", "snap-1").unwrap())
        .await
        .unwrap();

    wait_until_no_data(&store).await;
    assert_eq!(plugin.snapshot_count(), 0);
    assert_eq!(plugin.create_calls(), 1);
    stop_controller(stopper, running).await;
}

#[cfg(feature = "hostpath")]
mod hostpath {
    use super::*;
    use tempfile::TempDir;
    use volsnap_core::{FileObjectStore, SnapshotSource};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_archives_host_path_volume_through_file_store() {
        let dir = TempDir::new().unwrap();
        let volume_dir = dir.path().join("volumes/pv-1");
        std::fs::create_dir_all(&volume_dir).unwrap();
        std::fs::write(volume_dir.join("data.txt"), b"hello snapshot").unwrap();
        let archive_dir = dir.path().join("archives");

        let store = FileObjectStore::with_watch_interval(
            dir.path().join("state"),
            Duration::from_millis(50),
        )
        .unwrap();
        store
            .put_claim(VolumeClaim::bound("default", "pvc-1", "pv-1"))
            .await
            .unwrap();
        store
            .put_volume(Volume::new(
                "pv-1",
                VolumeSource::HostPath {
                    path: volume_dir.display().to_string(),
                },
            ))
            .await
            .unwrap();

        let mut config = fast_config("ctrl-a");
        config.backend = volsnap_core::BackendConfig::HostPath {
            archive_dir: archive_dir.clone(),
        };
        let controller = Arc::new(
            SnapshotController::from_config(config, Arc::new(store.clone()))
                .await
                .unwrap(),
        );
        let (stop, shutdown) = watch::channel(false);
        let running = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run(shutdown).await })
        };

        store
            .create_request(SnapshotRequest::new("default", "snap-1", "pvc-1"))
            .await
            .unwrap();
        let key = SnapshotKey::new("default", "snap-1").unwrap();
        let request = wait_until_ready(&store, &key).await;

        let data = store
            .get_data(request.snapshot_data_name().unwrap())
            .await
            .unwrap();
        let SnapshotSource::HostPath { path } = &data.spec.source else {
            panic!("unexpected source {:?}", data.spec.source);
        };
        let archive = std::path::PathBuf::from(path);
        assert!(archive.exists());
        assert_eq!(archive.parent(), Some(archive_dir.as_path()));
        assert!(data.status.creation_timestamp.is_some());

        store.delete_request(&key).await.unwrap();
        wait_until_no_data(&store).await;
        assert!(!archive.exists());
        assert!(volume_dir.join("data.txt").exists());

        stop.send_replace(true);
        tokio::time::timeout(DEADLINE, running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
