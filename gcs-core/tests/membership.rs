//! Unit tests for the membership protocol
//!
//! Tests join/leave propagation, the local cache, callback fan-out and
//! teardown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gcs_core::backend::MemoryBackend;
use gcs_core::tables::client::ClientTableData;
use gcs_core::{AsyncGcsClient, ClientId, GcsClientConfig, GcsError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out waiting for the GCS")
}

fn client_on(backend: &Arc<MemoryBackend>) -> AsyncGcsClient {
    AsyncGcsClient::with_backend(backend.clone(), Handle::current(), GcsClientConfig::default())
}

fn local_info(client: &AsyncGcsClient, port: u16) -> ClientTableData {
    let mut info = client.client_table().local_client();
    info.node_manager_address = "127.0.0.1".into();
    info.node_manager_port = port;
    info.object_manager_port = port + 1;
    info
}

/// Forward membership events of one kind into a channel
fn watch(client: &AsyncGcsClient, added: bool) -> mpsc::UnboundedReceiver<ClientTableData> {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |_: &ClientId, data: &ClientTableData| {
        let _ = tx.send(data.clone());
    };
    if added {
        client.client_table().register_client_added_callback(callback);
    } else {
        client.client_table().register_client_removed_callback(callback);
    }
    rx
}

#[tokio::test]
async fn test_connect_then_disconnect() {
    let backend = Arc::new(MemoryBackend::new());
    let client = client_on(&backend);
    let me = client.client_table().local_client_id();
    let mut added = watch(&client, true);
    let mut removed = watch(&client, false);

    let connected = client.client_table().connect(local_info(&client, 5000)).unwrap();
    let left = client.client_table().disconnect().unwrap();
    within(connected).await.unwrap();
    within(left).await.unwrap();

    let joined = within(added.recv()).await.unwrap();
    assert_eq!(joined.client_id, me);
    assert!(joined.is_insertion);
    assert_eq!(joined.node_manager_address, "127.0.0.1");

    let departed = within(removed.recv()).await.unwrap();
    assert_eq!(departed.client_id, me);
    assert!(!departed.is_insertion);

    let cached = client.client_table().get_client(&me).unwrap();
    assert!(!cached.is_insertion);
    assert!(!client.client_table().is_connected());

    // The join is observed exactly once even though bootstrap saw it too
    assert!(added.try_recv().is_err());
}

#[tokio::test]
async fn test_cache_reflects_latest_record() {
    let backend = Arc::new(MemoryBackend::new());
    let client = client_on(&backend);
    let me = client.client_id();

    within(client.client_table().connect(local_info(&client, 6000)).unwrap())
        .await
        .unwrap();
    let cached = client.client_table().get_client(&me).unwrap();
    assert!(cached.is_insertion);
    assert_eq!(cached.node_manager_port, 6000);
    assert_eq!(client.client_table().local_client().node_manager_port, 6000);
    assert!(client.client_table().is_connected());
}

#[tokio::test]
async fn test_clients_discover_each_other() {
    let backend = Arc::new(MemoryBackend::new());
    let first = client_on(&backend);
    let second = client_on(&backend);
    let mut first_added = watch(&first, true);

    within(first.client_table().connect(local_info(&first, 7000)).unwrap())
        .await
        .unwrap();
    assert_eq!(within(first_added.recv()).await.unwrap().client_id, first.client_id());

    // The second client learns of the first from the existing log
    within(second.client_table().connect(local_info(&second, 7100)).unwrap())
        .await
        .unwrap();
    assert!(second.client_table().get_client(&first.client_id()).unwrap().is_insertion);
    assert_eq!(second.client_table().clients().len(), 2);

    // The first client learns of the second through its subscription
    let joined = within(first_added.recv()).await.unwrap();
    assert_eq!(joined.client_id, second.client_id());
    assert_eq!(joined.node_manager_port, 7100);
}

#[tokio::test]
async fn test_late_callback_sees_live_clients() {
    let backend = Arc::new(MemoryBackend::new());
    let client = client_on(&backend);

    within(client.client_table().connect(local_info(&client, 8000)).unwrap())
        .await
        .unwrap();

    let mut added = watch(&client, true);
    assert_eq!(added.try_recv().unwrap().client_id, client.client_id());
}

#[tokio::test]
async fn test_callbacks_fire_in_registration_order() {
    let backend = Arc::new(MemoryBackend::new());
    let client = client_on(&backend);
    let (tx, mut rx) = mpsc::unbounded_channel();
    for tag in 0..3 {
        let tx = tx.clone();
        client
            .client_table()
            .register_client_added_callback(move |_: &ClientId, _: &ClientTableData| {
                let _ = tx.send(tag);
            });
    }

    within(client.client_table().connect(local_info(&client, 8100)).unwrap())
        .await
        .unwrap();
    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(within(rx.recv()).await.unwrap());
    }
    assert_eq!(order, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_protocol_state_errors() {
    let backend = Arc::new(MemoryBackend::new());
    let client = client_on(&backend);

    assert!(matches!(
        client.client_table().disconnect(),
        Err(GcsError::NotConnected { .. })
    ));

    let stranger = ClientTableData::new(ClientId::from_random());
    assert!(matches!(
        client.client_table().connect(stranger),
        Err(GcsError::InvalidArgument { .. })
    ));

    within(client.client_table().connect(local_info(&client, 9000)).unwrap())
        .await
        .unwrap();
    assert!(matches!(
        client.client_table().connect(local_info(&client, 9000)),
        Err(GcsError::AlreadyConnected { .. })
    ));
}

#[tokio::test]
async fn test_no_callbacks_after_shutdown() {
    let backend = Arc::new(MemoryBackend::new());
    let observer = client_on(&backend);
    let joiner = client_on(&backend);
    let mut added = watch(&observer, true);

    within(observer.client_table().connect(local_info(&observer, 9100)).unwrap())
        .await
        .unwrap();
    within(added.recv()).await.unwrap();

    observer.shutdown();
    within(joiner.client_table().connect(local_info(&joiner, 9200)).unwrap())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(added.try_recv().is_err());
    assert!(observer.client_table().get_client(&joiner.client_id()).is_none());
}
