use opsync_agent::{
    ChannelState, Delivery, MqttConnector, OfflineQueue, QueueConfig, SqliteStore,
    TransportChannel, TransportConfig,
};
use opsync_core::{
    Collection, DeviceId, Operation, OperationKind, OperationManager, Priority, Record,
};
use opsync_proto::TopicScheme;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

fn task(manager: &mut OperationManager, kind: OperationKind, id: &str, name: &str) -> Operation {
    manager.create_operation(
        kind,
        Record::new(id).with_field("name", serde_json::json!(name)),
        Collection::Tasks,
    )
}

#[tokio::test]
async fn offline_session_survives_restart_and_drains() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.db");
    let mut manager = OperationManager::new(DeviceId::new("phone"));

    {
        let mut queue =
            OfflineQueue::open(SqliteStore::open(&path).unwrap(), QueueConfig::default()).unwrap();
        for name in ["draft", "better", "final"] {
            queue.enqueue(task(&mut manager, OperationKind::Update, "1", name));
        }
        queue.enqueue(task(&mut manager, OperationKind::Delete, "2", "gone"));
        queue.enqueue(task(&mut manager, OperationKind::Custom("photo".into()), "3", "upload"));
    }

    let mut queue =
        OfflineQueue::open(SqliteStore::open(&path).unwrap(), QueueConfig::default()).unwrap();
    assert_eq!(queue.len(), 5);

    assert_eq!(queue.compact_operation_log().unwrap(), 2);
    let survivor = queue
        .entries()
        .iter()
        .find(|e| e.operation.payload().id == "1")
        .unwrap();
    assert_eq!(survivor.operation.payload().fields["name"], "final");

    let delivered = Mutex::new(Vec::new());
    let report = queue
        .process_queue(|op| {
            delivered.lock().unwrap().push(op.payload().id.clone());
            async { Ok::<(), String>(()) }
        })
        .await;

    assert_eq!(report.sent, 3);
    assert_eq!(*delivered.lock().unwrap(), vec!["2", "1", "3"]);

    let reopened =
        OfflineQueue::open(SqliteStore::open(&path).unwrap(), QueueConfig::default()).unwrap();
    assert!(reopened.is_empty());
}

#[tokio::test]
async fn expired_operations_are_never_sent() {
    let mut queue =
        OfflineQueue::open(SqliteStore::in_memory().unwrap(), QueueConfig::default()).unwrap();
    let mut manager = OperationManager::new(DeviceId::new("phone"));

    queue.enqueue_at(
        task(&mut manager, OperationKind::Create, "1", "old"),
        chrono::Utc::now() - chrono::Duration::milliseconds(2000),
    );

    assert_eq!(queue.clean_expired_operations(Duration::from_millis(1000)), 1);

    let report = queue
        .process_queue(|_| async { Err::<(), _>("must not be called") })
        .await;
    assert_eq!(report.sent + report.failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_operation_roundtrip() {
    if std::env::var("OPSYNC_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set OPSYNC_INTEGRATION=1 to run");
        return;
    }

    let broker = std::env::var("OPSYNC_MQTT_BROKER")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let scheme = TopicScheme::new(format!("integration-{}", Uuid::new_v4()));
    let phone = DeviceId::new("phone");
    let tablet = DeviceId::new("tablet");

    let receiver = TransportChannel::new(
        MqttConnector::new(&broker, &tablet, Some(&phone), &scheme).unwrap(),
        TransportConfig::default(),
    );
    let mut inbound = receiver.subscribe();
    receiver.connect().await.unwrap();

    let sender = TransportChannel::new(
        MqttConnector::new(&broker, &phone, Some(&tablet), &scheme).unwrap(),
        TransportConfig::default(),
    );
    sender.connect().await.unwrap();
    assert_eq!(sender.state(), ChannelState::Connected);

    // Give the receiver's SUBSCRIBE time to be acknowledged.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut manager = OperationManager::new(phone);
    let op = task(&mut manager, OperationKind::Complete, "1", "dishes");
    let delivery = sender.send_operation(&op, Priority::Critical).await.unwrap();
    assert_eq!(delivery, Delivery::Sent);

    let envelope = timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("timed out waiting for operation")
        .unwrap();

    assert_eq!(envelope.operation, op);
    assert_eq!(envelope.priority, Priority::Critical);

    sender.close().await;
    receiver.close().await;
}
