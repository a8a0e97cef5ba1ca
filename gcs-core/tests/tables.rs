//! Unit tests for the typed tables
//!
//! Tests add/lookup, subscriptions, filtered notifications and conditional
//! task updates against the in-process backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gcs_core::backend::{Backend, MemoryBackend};
use gcs_core::tables::heartbeat::HeartbeatTableData;
use gcs_core::tables::object::ObjectTableData;
use gcs_core::tables::task::{SchedulingState, TaskTableData, TaskTableTestAndUpdate};
use gcs_core::tables::{channel_name, TableKind};
use gcs_core::{AsyncGcsClient, ClientId, GcsClientConfig, GcsError, JobId, ObjectId, TaskId};
use tokio::runtime::Handle;

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out waiting for the GCS")
}

fn client_on(backend: &Arc<MemoryBackend>) -> AsyncGcsClient {
    AsyncGcsClient::with_backend(backend.clone(), Handle::current(), GcsClientConfig::default())
}

mod object_table {
    use super::*;

    #[tokio::test]
    async fn test_add_then_lookup() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client_on(&backend);
        let job = JobId::from_random();
        let object = ObjectId::from_random();

        let added = client
            .object_table()
            .add(job, object, ObjectTableData::new(["A", "B"]))
            .unwrap();
        // Keys are not job scoped: a nil-job lookup sees the write
        let found = client.object_table().lookup(JobId::nil(), object).unwrap();

        assert_eq!(within(added).await.unwrap().managers, vec!["A", "B"]);
        assert_eq!(within(found).await.unwrap().unwrap().managers, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_lookup_miss_is_not_an_error() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client_on(&backend);

        let found = client
            .object_table()
            .lookup(JobId::nil(), ObjectId::from_random())
            .unwrap();
        assert_eq!(within(found).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_repeated_adds_each_published() {
        let backend = Arc::new(MemoryBackend::new());
        let reader = client_on(&backend);
        let writer = client_on(&backend);
        let object = ObjectId::from_random();

        let mut subscription = reader.object_table().subscribe(JobId::nil(), ClientId::nil()).unwrap();
        within(subscription.acknowledged()).await.unwrap();

        within(writer.object_table().add(JobId::nil(), object, ObjectTableData::new(["A"])).unwrap())
            .await
            .unwrap();
        within(writer.object_table().add(JobId::nil(), object, ObjectTableData::new(["B"])).unwrap())
            .await
            .unwrap();

        let first = within(subscription.next()).await.unwrap();
        let second = within(subscription.next()).await.unwrap();
        assert_eq!(first.id, object);
        assert_eq!(first.data.managers, vec!["A"]);
        assert_eq!(second.data.managers, vec!["B"]);
        assert_eq!(first.index, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_writers_notify_in_commit_order() {
        let backend = Arc::new(MemoryBackend::new());
        let reader = client_on(&backend);
        let object = ObjectId::from_random();

        let mut subscription = reader.object_table().subscribe(JobId::nil(), ClientId::nil()).unwrap();
        within(subscription.acknowledged()).await.unwrap();

        let mut writers = Vec::new();
        for name in ["left", "right"] {
            let writer = client_on(&backend);
            writers.push(tokio::spawn(async move {
                for round in 0..50 {
                    let data = ObjectTableData::new([format!("{}-{}", name, round)]);
                    writer.object_table().add(JobId::nil(), object, data).unwrap().await.unwrap();
                }
            }));
        }
        for writer in writers {
            within(writer).await.unwrap();
        }

        let mut last = None;
        for _ in 0..100 {
            last = Some(within(subscription.next()).await.unwrap().data);
        }
        // Subscribers end on the value that is actually stored
        let stored = within(reader.object_table().lookup(JobId::nil(), object).unwrap())
            .await
            .unwrap();
        assert_eq!(last, stored);
    }
}

mod subscriptions {
    use super::*;

    #[tokio::test]
    async fn test_job_scoped_channels() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client_on(&backend);
        let job = JobId::from_random();
        let other_job = JobId::from_random();

        let mut scoped = client.object_table().subscribe(job, ClientId::nil()).unwrap();
        let mut everything = client.object_table().subscribe(JobId::nil(), ClientId::nil()).unwrap();
        within(scoped.acknowledged()).await.unwrap();
        within(everything.acknowledged()).await.unwrap();

        let elsewhere = ObjectId::from_random();
        let here = ObjectId::from_random();
        within(client.object_table().add(other_job, elsewhere, ObjectTableData::new(["X"])).unwrap())
            .await
            .unwrap();
        within(client.object_table().add(job, here, ObjectTableData::new(["Y"])).unwrap())
            .await
            .unwrap();

        // The scoped subscriber only sees its own job
        assert_eq!(within(scoped.next()).await.unwrap().id, here);
        assert_eq!(within(everything.next()).await.unwrap().id, elsewhere);
        assert_eq!(within(everything.next()).await.unwrap().id, here);
    }

    #[tokio::test]
    async fn test_malformed_notification_dropped() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client_on(&backend);

        let mut subscription = client.object_table().subscribe(JobId::nil(), ClientId::nil()).unwrap();
        within(subscription.acknowledged()).await.unwrap();

        let channel = channel_name(TableKind::Object, JobId::nil(), ClientId::nil());
        backend.publish(&channel, Bytes::from_static(b"not json")).await.unwrap();

        let object = ObjectId::from_random();
        within(client.object_table().add(JobId::nil(), object, ObjectTableData::new(["A"])).unwrap())
            .await
            .unwrap();

        let notification = within(subscription.next()).await.unwrap();
        assert_eq!(notification.id, object);
    }

    #[tokio::test]
    async fn test_filtered_notifications() {
        let backend = Arc::new(MemoryBackend::new());
        let reader = client_on(&backend);
        let writer = client_on(&backend);
        let me = reader.client_id();
        let wanted = ObjectId::from_random();
        let ignored = ObjectId::from_random();

        within(writer.object_table().add(JobId::nil(), wanted, ObjectTableData::new(["v1"])).unwrap())
            .await
            .unwrap();

        let mut filtered = reader.object_table().subscribe(JobId::nil(), me).unwrap();
        within(filtered.acknowledged()).await.unwrap();

        // Requesting delivers the current value right away
        within(reader.object_table().request_notifications(JobId::nil(), wanted, me).unwrap())
            .await
            .unwrap();
        assert_eq!(within(filtered.next()).await.unwrap().data.managers, vec!["v1"]);

        within(writer.object_table().add(JobId::nil(), ignored, ObjectTableData::new(["x"])).unwrap())
            .await
            .unwrap();
        within(writer.object_table().add(JobId::nil(), wanted, ObjectTableData::new(["v2"])).unwrap())
            .await
            .unwrap();
        let next = within(filtered.next()).await.unwrap();
        assert_eq!(next.id, wanted);
        assert_eq!(next.data.managers, vec!["v2"]);

        within(reader.object_table().cancel_notifications(JobId::nil(), wanted, me).unwrap())
            .await
            .unwrap();
        within(writer.object_table().add(JobId::nil(), wanted, ObjectTableData::new(["v3"])).unwrap())
            .await
            .unwrap();
        let silent = tokio::time::timeout(Duration::from_millis(100), filtered.next()).await;
        assert!(silent.is_err(), "cancelled request still delivered");
    }

    #[tokio::test]
    async fn test_request_needs_client() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client_on(&backend);
        let result = client
            .object_table()
            .request_notifications(JobId::nil(), ObjectId::from_random(), ClientId::nil());
        assert!(matches!(result, Err(GcsError::InvalidArgument { .. })));
    }
}

mod task_table {
    use super::*;

    fn scheduled_by(owner: ClientId) -> TaskTableData {
        TaskTableData {
            scheduling_state: SchedulingState::Scheduled,
            scheduler_id: owner,
        }
    }

    #[tokio::test]
    async fn test_test_and_update() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client_on(&backend);
        let job = JobId::from_random();
        let task = TaskId::from_random();
        let owner = client.client_id();

        within(client.task_table().add(job, task, scheduled_by(owner)).unwrap())
            .await
            .unwrap();

        let update = TaskTableTestAndUpdate {
            test_scheduler_id: owner,
            test_state_bitmask: SchedulingState::Scheduled.into(),
            update_state: SchedulingState::Lost,
        };
        let first = within(client.task_table().test_and_update(job, task, update).unwrap())
            .await
            .unwrap();
        assert!(first.updated);
        assert_eq!(first.entry.unwrap().scheduling_state, SchedulingState::Lost);

        // The state no longer matches the mask
        let second = within(client.task_table().test_and_update(job, task, update).unwrap())
            .await
            .unwrap();
        assert!(!second.updated);
        assert_eq!(second.entry.unwrap().scheduling_state, SchedulingState::Lost);

        let stored = within(client.task_table().lookup(job, task).unwrap()).await.unwrap();
        assert_eq!(stored.unwrap().scheduling_state, SchedulingState::Lost);
    }

    #[tokio::test]
    async fn test_update_missing_task() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client_on(&backend);
        let update = TaskTableTestAndUpdate {
            test_scheduler_id: ClientId::nil(),
            test_state_bitmask: SchedulingState::Waiting.into(),
            update_state: SchedulingState::Scheduled,
        };
        let result = within(
            client
                .task_table()
                .test_and_update(JobId::nil(), TaskId::from_random(), update)
                .unwrap(),
        )
        .await
        .unwrap();
        assert!(!result.updated);
        assert!(result.entry.is_none());
    }

    #[tokio::test]
    async fn test_racing_claims_single_winner() {
        let backend = Arc::new(MemoryBackend::new());
        let first = client_on(&backend);
        let second = client_on(&backend);
        let task = TaskId::from_random();

        let waiting = TaskTableData {
            scheduling_state: SchedulingState::Waiting,
            scheduler_id: ClientId::nil(),
        };
        within(first.task_table().add(JobId::nil(), task, waiting).unwrap())
            .await
            .unwrap();

        let claim = TaskTableTestAndUpdate {
            test_scheduler_id: ClientId::nil(),
            test_state_bitmask: SchedulingState::Waiting.into(),
            update_state: SchedulingState::Scheduled,
        };
        let a = first.task_table().test_and_update(JobId::nil(), task, claim).unwrap();
        let b = second.task_table().test_and_update(JobId::nil(), task, claim).unwrap();
        let (a, b) = within(async { tokio::join!(a, b) }).await;

        let winners = [a.unwrap().updated, b.unwrap().updated]
            .iter()
            .filter(|updated| **updated)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_update_is_published() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client_on(&backend);
        let task = TaskId::from_random();
        let owner = ClientId::from_random();

        within(client.task_table().add(JobId::nil(), task, scheduled_by(owner)).unwrap())
            .await
            .unwrap();
        let mut subscription = client.task_table().subscribe(JobId::nil(), ClientId::nil()).unwrap();
        within(subscription.acknowledged()).await.unwrap();

        let update = TaskTableTestAndUpdate {
            test_scheduler_id: owner,
            test_state_bitmask: SchedulingState::Scheduled | SchedulingState::Queued,
            update_state: SchedulingState::Running,
        };
        within(client.task_table().test_and_update(JobId::nil(), task, update).unwrap())
            .await
            .unwrap();

        let notification = within(subscription.next()).await.unwrap();
        assert_eq!(notification.id, task);
        assert_eq!(notification.data.scheduling_state, SchedulingState::Running);
    }
}

mod heartbeat_table {
    use super::*;

    #[tokio::test]
    async fn test_alignment_survives_round_trip() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client_on(&backend);
        let id = client.client_id();

        let mut subscription = client.heartbeat_table().subscribe(JobId::nil(), ClientId::nil()).unwrap();
        within(subscription.acknowledged()).await.unwrap();

        let heartbeat = HeartbeatTableData::new(id)
            .with_resource("CPU", 1.0, 2.0)
            .with_resource("GPU", 0.0, 2.0);
        within(client.heartbeat_table().add(JobId::nil(), id, heartbeat).unwrap())
            .await
            .unwrap();

        let looked_up = within(client.heartbeat_table().lookup(JobId::nil(), id).unwrap())
            .await
            .unwrap()
            .unwrap();
        let notified = within(subscription.next()).await.unwrap().data;

        for data in [looked_up, notified] {
            let wire = data.to_wire();
            assert_eq!(wire.resources_available_label, vec!["CPU", "GPU"]);
            assert_eq!(wire.resources_available_capacity, vec![1.0, 0.0]);
            assert_eq!(wire.resources_total_label, vec!["CPU", "GPU"]);
            assert_eq!(wire.resources_total_capacity, vec![2.0, 2.0]);
        }
    }

    #[tokio::test]
    async fn test_heartbeat_stored_under_own_client() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client_on(&backend);
        let other = ClientId::from_random();

        let heartbeat = HeartbeatTableData::new(client.client_id()).with_resource("CPU", 1.0, 1.0);
        let result = client.heartbeat_table().add(JobId::nil(), other, heartbeat);
        assert!(matches!(result, Err(GcsError::InvalidArgument { .. })));

        let found = within(client.heartbeat_table().lookup(JobId::nil(), other).unwrap())
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_misaligned_stored_entry_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let client = client_on(&backend);
        let id = ClientId::from_random();

        let payload = serde_json::json!({
            "client_id": id,
            "resources_available_label": ["CPU", "GPU"],
            "resources_available_capacity": [1.0],
            "resources_total_label": [],
            "resources_total_capacity": [],
        });
        let key = gcs_core::tables::entry_key(TableKind::Heartbeat, id.unique());
        backend
            .put(&key, Bytes::from(serde_json::to_vec(&payload).unwrap()))
            .await
            .unwrap();

        let result = within(client.heartbeat_table().lookup(JobId::nil(), id).unwrap()).await;
        match result {
            Err(e) => assert!(e.is_invariant_violation()),
            Ok(found) => panic!("misaligned heartbeat decoded: {:?}", found),
        }
    }
}
