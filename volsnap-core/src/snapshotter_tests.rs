/*!
Tests for the Snapshotter against the in-memory store and backend.
*/

#[cfg(test)]
mod tests {
    use crate::cache::ActualStateOfWorld;
    use crate::config::ControllerConfig;
    use crate::model::*;
    use crate::operation::OperationKind;
    use crate::plugin::memory::FailureMode;
    use crate::plugin::{MemoryPlugin, PluginRegistry, SnapshotPlugin};
    use crate::snapshotter::{Dispatch, SnapshotOperations, Snapshotter};
    use crate::store::{MemoryObjectStore, ObjectStore};
    use crate::SnapshotError;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        store: MemoryObjectStore,
        plugin: Arc<MemoryPlugin>,
        actual: Arc<ActualStateOfWorld>,
        snapshotter: Snapshotter,
    }

    fn config(instance_id: &str) -> ControllerConfig {
        let mut config = ControllerConfig::default().with_instance_id(instance_id);
        config.snapshot_wait.initial_delay_ms = 5;
        config.snapshot_wait.steps = 10;
        config
    }

    async fn fixture(instance_id: &str) -> Fixture {
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

        let plugin = Arc::new(MemoryPlugin::new());
        let actual = Arc::new(ActualStateOfWorld::new());
        let snapshotter = Snapshotter::new(
            &config(instance_id),
            Arc::new(store.clone()),
            PluginRegistry::new().with_plugin(plugin.clone()),
            Arc::clone(&actual),
        );
        Fixture {
            store,
            plugin,
            actual,
            snapshotter,
        }
    }

    async fn stored_request(store: &MemoryObjectStore, name: &str) -> SnapshotRequest {
        store
            .create_request(SnapshotRequest::new("default", name, "pvc-1"))
            .await
            .unwrap()
    }

    fn key(name: &str) -> SnapshotKey {
        SnapshotKey::new("default", name).unwrap()
    }

    #[tokio::test]
    async fn test_create_records_ready_snapshot() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;

        let dispatch = f.snapshotter.create_snapshot(&request).unwrap();
        assert!(dispatch.is_started());
        dispatch.finished().await.unwrap();

        let actual = f.actual.get(&key("snap-1")).unwrap();
        assert_eq!(actual.data.status(), SimplifiedStatus::Ready);
        assert_eq!(actual.data.status.conditions.len(), 1);
        assert_eq!(actual.data.owner(), Some("ctrl-a"));
        assert_eq!(actual.data.spec.persistent_volume_ref, "pv-1");

        let data = f.store.list_data().await.unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].spec.source, actual.data.spec.source);
        assert!(f.plugin.contains(data[0].spec.source.id()));

        let bound = f.store.get_request(&key("snap-1")).await.unwrap();
        assert_eq!(bound.snapshot_data_name(), Some(data[0].name()));
        assert_eq!(bound.status(), SimplifiedStatus::Ready);
        assert!(bound.metadata.labels.contains_key(SNAPSHOT_TIMESTAMP_LABEL));
        assert_eq!(
            bound.metadata.labels.get(SNAPSHOT_VOLUME_LABEL).map(String::as_str),
            Some("pv-1")
        );

        assert_eq!(f.plugin.create_calls(), 1);
        assert!(f.snapshotter.operations().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_triggers_create_once() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;
        f.plugin.pause();

        let first = f.snapshotter.create_snapshot(&request).unwrap();
        assert!(first.is_started());
        for _ in 0..9 {
            let dispatch = f.snapshotter.create_snapshot(&request).unwrap();
            assert!(matches!(dispatch, Dispatch::InProgress(OperationKind::Create)));
        }

        f.plugin.resume();
        first.finished().await.unwrap();
        assert_eq!(f.plugin.create_calls(), 1);
        assert_eq!(f.store.list_data().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_for_existing_snapshot_is_skipped() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;
        f.snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap();

        let again = f.snapshotter.create_snapshot(&request).unwrap();
        assert!(matches!(again, Dispatch::AlreadyExists));
        assert_eq!(f.plugin.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_by_next_trigger() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;
        f.plugin.fail_creates(1, FailureMode::Transient);

        let err = f
            .snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Backend { .. }));
        assert!(!f.actual.exists(&key("snap-1")));
        assert!(f.snapshotter.operations().is_empty());
        assert!(f.store.list_data().await.unwrap().is_empty());

        f.snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap();
        assert!(f.actual.exists(&key("snap-1")));
        assert_eq!(f.plugin.create_calls(), 2);
        assert_eq!(f.store.list_data().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_data_and_actual() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;
        f.snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap();

        let actual = f.actual.get(&key("snap-1")).unwrap();
        f.snapshotter
            .delete_snapshot(&actual)
            .unwrap()
            .finished()
            .await
            .unwrap();

        assert!(f.actual.is_empty());
        assert!(f.store.list_data().await.unwrap().is_empty());
        assert_eq!(f.plugin.snapshot_count(), 0);
        assert_eq!(f.plugin.delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_actual_entry() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;
        f.snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap();
        f.plugin.fail_deletes(1, FailureMode::Transient);

        let actual = f.actual.get(&key("snap-1")).unwrap();
        let result = f.snapshotter.delete_snapshot(&actual).unwrap().finished().await;
        assert!(result.is_err());
        assert!(f.actual.exists(&key("snap-1")));
        assert_eq!(f.store.list_data().await.unwrap().len(), 1);
        assert!(f.snapshotter.operations().is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_foreign_snapshot_is_not_owned() {
        let f = fixture("ctrl-b").await;
        let request = SnapshotRequest::new("default", "snap-1", "pvc-1");
        let data = SnapshotData::new(
            key("snap-1"),
            "pv-1",
            SnapshotSource::Memory {
                snapshot_id: "mem-foreign".to_string(),
            },
            "ctrl-a",
        );

        let dispatch = f
            .snapshotter
            .delete_snapshot(&ActualSnapshot { request, data })
            .unwrap();
        match dispatch {
            Dispatch::NotOwned { owner } => assert_eq!(owner, "ctrl-a"),
            other => panic!("unexpected dispatch {other:?}"),
        }
        assert_eq!(f.plugin.delete_calls(), 0);
        assert!(f.snapshotter.operations().is_empty());
    }

    #[tokio::test]
    async fn test_create_for_foreign_request_is_not_owned() {
        let f = fixture("ctrl-b").await;
        let request = SnapshotRequest::new("default", "snap-1", "pvc-1").with_controller("ctrl-a");

        let dispatch = f.snapshotter.create_snapshot(&request).unwrap();
        assert!(matches!(dispatch, Dispatch::NotOwned { .. }));
        assert_eq!(f.plugin.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_waits_for_outstanding_create() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;
        f.plugin.pause();

        let create = f.snapshotter.create_snapshot(&request).unwrap();
        let phantom = ActualSnapshot {
            request: request.clone(),
            data: SnapshotData::new(
                key("snap-1"),
                "pv-1",
                SnapshotSource::Memory {
                    snapshot_id: "mem-x".to_string(),
                },
                "ctrl-a",
            ),
        };
        let delete = f.snapshotter.delete_snapshot(&phantom).unwrap();
        assert!(matches!(delete, Dispatch::InProgress(OperationKind::Create)));

        f.plugin.resume();
        create.finished().await.unwrap();

        let actual = f.actual.get(&key("snap-1")).unwrap();
        let delete = f.snapshotter.delete_snapshot(&actual).unwrap();
        assert!(delete.is_started());
        delete.finished().await.unwrap();
        assert!(f.actual.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_source_makes_no_backend_call() {
        let f = fixture("ctrl-a").await;
        let request = f
            .store
            .create_request(SnapshotRequest::new("default", "snap-1", "missing-claim"))
            .await
            .unwrap();

        let err = f
            .snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::SourceUnresolvable(_)));
        assert_eq!(f.plugin.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_request_without_claim_is_malformed() {
        let f = fixture("ctrl-a").await;
        let request = SnapshotRequest::new("default", "snap-1", "");
        let err = f.snapshotter.create_snapshot(&request).unwrap_err();
        assert!(matches!(err, SnapshotError::Malformed(_)));
        assert!(f.snapshotter.operations().is_empty());
    }

    #[tokio::test]
    async fn test_recovers_backend_snapshot_by_tags() {
        let f = fixture("ctrl-a").await;
        let mut request = stored_request(&f.store, "snap-1").await;

        // An earlier attempt stamped the request and reached the backend,
        // then died before writing SnapshotData.
        request
            .metadata
            .labels
            .insert(SNAPSHOT_TIMESTAMP_LABEL.to_string(), "1700000000".to_string());
        request
            .metadata
            .labels
            .insert(SNAPSHOT_VOLUME_LABEL.to_string(), "pv-1".to_string());
        let request = f.store.update_request(request).await.unwrap();
        let volume = f.store.get_volume("pv-1").await.unwrap();
        let earlier = f
            .plugin
            .snapshot_create(&volume, &request.backend_tags().unwrap())
            .await
            .unwrap();

        f.snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap();

        assert_eq!(f.plugin.create_calls(), 1);
        let actual = f.actual.get(&key("snap-1")).unwrap();
        assert_eq!(actual.data.spec.source, earlier.source);
        let bound = f.store.get_request(&key("snap-1")).await.unwrap();
        assert_eq!(bound.snapshot_data_name(), Some(actual.data.name()));
    }

    #[tokio::test]
    async fn test_adopts_data_referencing_request() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;
        let mut data = SnapshotData::new(
            key("snap-1"),
            "pv-1",
            SnapshotSource::Memory {
                snapshot_id: "mem-earlier".to_string(),
            },
            "ctrl-a",
        );
        data.record_condition(Condition::ready("done"));
        let data = f.store.create_data(data).await.unwrap();

        f.snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap();

        assert_eq!(f.plugin.create_calls(), 0);
        assert_eq!(f.actual.get(&key("snap-1")).unwrap().data.name(), data.name());
        let bound = f.store.get_request(&key("snap-1")).await.unwrap();
        assert_eq!(bound.snapshot_data_name(), Some(data.name()));
        assert_eq!(bound.status(), SimplifiedStatus::Ready);
    }

    #[tokio::test]
    async fn test_refuses_to_adopt_foreign_data() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;
        let data = SnapshotData::new(
            key("snap-1"),
            "pv-1",
            SnapshotSource::Memory {
                snapshot_id: "mem-other".to_string(),
            },
            "ctrl-b",
        );
        f.store.create_data(data).await.unwrap();

        let err = f
            .snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap_err();
        assert!(err.is_not_owned());
        assert_eq!(f.plugin.create_calls(), 0);
        assert!(!f.actual.exists(&key("snap-1")));
    }

    #[tokio::test]
    async fn test_waits_for_asynchronous_snapshot() {
        let f = fixture("ctrl-a").await;
        f.plugin.complete_after_describes(2);
        let request = stored_request(&f.store, "snap-1").await;

        f.snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap();

        let actual = f.actual.get(&key("snap-1")).unwrap();
        let types: Vec<_> = actual
            .data
            .status
            .conditions
            .iter()
            .map(|c| c.condition_type)
            .collect();
        assert_eq!(types, vec![ConditionType::Pending, ConditionType::Ready]);
        assert!(actual.data.status.creation_timestamp.is_some());

        let request = f.store.get_request(&key("snap-1")).await.unwrap();
        assert_eq!(request.status(), SimplifiedStatus::Ready);
        assert_eq!(request.status.conditions.len(), 2);
    }

    #[tokio::test]
    async fn test_wait_times_out_and_resumes_later() {
        let f = fixture("ctrl-a").await;
        f.plugin.complete_after_describes(1_000);
        let request = stored_request(&f.store, "snap-1").await;

        let err = f
            .snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Retry(_)));
        assert!(!f.actual.exists(&key("snap-1")));

        // The next attempt resumes the Pending snapshot instead of creating another.
        f.plugin.complete_after_describes(0);
        f.snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap();
        assert_eq!(f.plugin.create_calls(), 1);
        assert!(f.actual.exists(&key("snap-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_writes_are_retried() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;
        f.store.fail_next_writes(2);

        f.snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap();
        assert!(f.actual.exists(&key("snap-1")));
        assert_eq!(f.plugin.create_calls(), 1);
    }

    async fn wait_for_create_call(plugin: &MemoryPlugin) {
        while plugin.create_calls() == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_request_deleted_during_create_discards_snapshot() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;
        f.plugin.pause();

        let dispatch = f.snapshotter.create_snapshot(&request).unwrap();
        wait_for_create_call(&f.plugin).await;
        f.store.delete_request(&key("snap-1")).await.unwrap();
        f.plugin.resume();
        dispatch.finished().await.unwrap();

        assert_eq!(f.plugin.create_calls(), 1);
        assert_eq!(f.plugin.delete_calls(), 1);
        assert_eq!(f.plugin.snapshot_count(), 0);
        assert!(f.store.list_data().await.unwrap().is_empty());
        assert!(!f.actual.exists(&key("snap-1")));
    }

    #[tokio::test]
    async fn test_recreated_request_is_not_bound_to_old_snapshot() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;
        f.plugin.pause();

        let dispatch = f.snapshotter.create_snapshot(&request).unwrap();
        wait_for_create_call(&f.plugin).await;
        f.store.delete_request(&key("snap-1")).await.unwrap();
        let recreated = stored_request(&f.store, "snap-1").await;
        assert_ne!(recreated.metadata.uid, request.metadata.uid);
        f.plugin.resume();
        dispatch.finished().await.unwrap();

        assert_eq!(f.plugin.snapshot_count(), 0);
        assert!(f.store.list_data().await.unwrap().is_empty());
        let stored = f.store.get_request(&key("snap-1")).await.unwrap();
        assert_eq!(stored.snapshot_data_name(), None);
        assert_eq!(stored.status(), SimplifiedStatus::New);
    }

    #[tokio::test]
    async fn test_request_deleted_while_waiting_discards_snapshot() {
        let f = fixture("ctrl-a").await;
        f.plugin.complete_after_describes(1_000);
        let request = stored_request(&f.store, "snap-1").await;

        let dispatch = f.snapshotter.create_snapshot(&request).unwrap();
        while f.plugin.calls().describe.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        f.store.delete_request(&key("snap-1")).await.unwrap();
        dispatch.finished().await.unwrap();

        assert_eq!(f.plugin.snapshot_count(), 0);
        assert!(f.store.list_data().await.unwrap().is_empty());
        assert!(!f.actual.exists(&key("snap-1")));
    }

    #[tokio::test]
    async fn test_collects_unready_snapshots_of_deleted_requests() {
        let f = fixture("ctrl-a").await;

        // Pending after the wait gave up.
        f.plugin.complete_after_describes(1_000);
        let request = stored_request(&f.store, "pending").await;
        let err = f
            .snapshotter
            .create_snapshot(&request)
            .unwrap()
            .finished()
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Retry(_)));
        f.store.delete_request(&key("pending")).await.unwrap();

        // Failed on the backend, request gone.
        let mut broken = SnapshotData::new(
            key("broken"),
            "pv-1",
            SnapshotSource::Memory {
                snapshot_id: "mem-broken".to_string(),
            },
            "ctrl-a",
        );
        broken.record_condition(Condition::error("UploadFailed", "backend gave up"));
        f.store.create_data(broken).await.unwrap();

        // Not ours, or still requested: left alone.
        let foreign = SnapshotData::new(
            key("foreign"),
            "pv-1",
            SnapshotSource::Memory {
                snapshot_id: "mem-foreign".to_string(),
            },
            "ctrl-b",
        );
        let foreign = f.store.create_data(foreign).await.unwrap();
        stored_request(&f.store, "kept").await;
        let kept = SnapshotData::new(
            key("kept"),
            "pv-1",
            SnapshotSource::Memory {
                snapshot_id: "mem-kept".to_string(),
            },
            "ctrl-a",
        );
        let kept = f.store.create_data(kept).await.unwrap();

        assert_eq!(f.snapshotter.collect_orphans().await.unwrap(), 2);
        f.snapshotter.operations().wait_idle().await;

        let mut remaining: Vec<_> = f
            .store
            .list_data()
            .await
            .unwrap()
            .into_iter()
            .map(|data| data.name().to_string())
            .collect();
        remaining.sort();
        let mut expected = vec![foreign.name().to_string(), kept.name().to_string()];
        expected.sort();
        assert_eq!(remaining, expected);
        assert_eq!(f.plugin.delete_calls(), 2);
        assert_eq!(f.plugin.snapshot_count(), 0);

        assert_eq!(f.snapshotter.collect_orphans().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_binding_keeps_concurrent_request_edits() {
        let f = fixture("ctrl-a").await;
        let request = stored_request(&f.store, "snap-1").await;
        f.plugin.pause();

        let dispatch = f.snapshotter.create_snapshot(&request).unwrap();
        wait_for_create_call(&f.plugin).await;
        let mut edited = f.store.get_request(&key("snap-1")).await.unwrap();
        edited
            .metadata
            .labels
            .insert("team".to_string(), "storage".to_string());
        f.store.update_request(edited).await.unwrap();
        f.plugin.resume();
        dispatch.finished().await.unwrap();

        let bound = f.store.get_request(&key("snap-1")).await.unwrap();
        assert_eq!(
            bound.metadata.labels.get("team").map(String::as_str),
            Some("storage")
        );
        assert!(bound.metadata.labels.contains_key(SNAPSHOT_TIMESTAMP_LABEL));
        assert!(bound.snapshot_data_name().is_some());
        assert_eq!(bound.status(), SimplifiedStatus::Ready);
        assert!(f.actual.exists(&key("snap-1")));
    }
}
