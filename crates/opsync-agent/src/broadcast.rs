//! Broadcast merge sync between co-located processes.
//!
//! Instead of operation logs, instances exchange whole values per data type
//! over a [`LocalBus`]. Local writes are debounced so a burst collapses into
//! one persist and one broadcast. Incoming values are merged with the
//! strategy registered for their data type and applied only when their
//! version is newer than the last one applied from the same sender.
//!
//! Without a bus the instance polls a shared [`SnapshotStore`] instead.
//! Presence (join, heartbeat, leave) needs the bus. With a [`RemoteStore`]
//! every flushed value is also saved there and merged back on start, so
//! data outlives the host.

use crate::persistence::{SnapshotRow, SnapshotStore};
use chrono::Utc;
use opsync_core::{DeviceId, MergeRegistry, Operation, Stamped};
use opsync_proto::{DeviceRecord, SyncKind, SyncMessage};
use opsync_remote::{snapshot_key, RemoteStore};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Broadcast sync tuning.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Quiet period before a local write is persisted and broadcast
    pub debounce: Duration,
    /// Peers silent for longer than this are evicted
    pub stale_after: Duration,
    /// Presence heartbeat period
    pub heartbeat_interval: Duration,
    /// Store polling period when no bus is available
    pub poll_interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            stale_after: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// In-host publish/subscribe with at-most-once delivery.
pub trait LocalBus: Send + Sync {
    /// Publish a frame to every current subscriber, the sender included.
    fn publish(&self, frame: Vec<u8>);

    /// Receive frames published from now on.
    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;
}

/// [`LocalBus`] over a `tokio` broadcast channel.
#[derive(Debug, Clone)]
pub struct ChannelBus {
    tx: broadcast::Sender<Vec<u8>>,
}

impl ChannelBus {
    /// Create a bus buffering up to `capacity` frames per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl LocalBus for ChannelBus {
    fn publish(&self, frame: Vec<u8>) {
        // Nobody listening: the frame is dropped.
        let _ = self.tx.send(frame);
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.tx.subscribe()
    }
}

/// A data type changed because of a remote write.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    /// Data type that changed
    pub data_type: String,
    /// Value after the merge
    pub value: Value,
    /// Device whose write caused the change
    pub origin_device: DeviceId,
}

#[derive(Debug, Clone)]
struct Slot {
    stamped: Stamped,
    version: u64,
}

struct PendingWrite {
    generation: u64,
    operation: Option<Operation>,
    timer: JoinHandle<()>,
}

struct Inner {
    device: DeviceId,
    name: String,
    config: BroadcastConfig,
    registry: MergeRegistry,
    bus: Option<Arc<dyn LocalBus>>,
    store: Option<Arc<dyn SnapshotStore>>,
    remote: Option<RemoteStore>,
    data: Mutex<HashMap<String, Slot>>,
    applied: Mutex<HashMap<(DeviceId, String), u64>>,
    devices: Mutex<BTreeMap<DeviceId, DeviceRecord>>,
    pending: Mutex<HashMap<String, PendingWrite>>,
    next_generation: Mutex<u64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    changes: broadcast::Sender<DataChange>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One participant of broadcast merge sync.
pub struct BroadcastSync {
    inner: Arc<Inner>,
}

impl BroadcastSync {
    /// Create an instance for `device`.
    ///
    /// At least one of `bus` and `store` should be given; with neither the
    /// instance only keeps local state.
    #[must_use]
    pub fn new(
        device: DeviceId,
        name: impl Into<String>,
        registry: MergeRegistry,
        bus: Option<Arc<dyn LocalBus>>,
        store: Option<Arc<dyn SnapshotStore>>,
        config: BroadcastConfig,
    ) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                device,
                name: name.into(),
                config,
                registry,
                bus,
                store,
                remote: None,
                data: Mutex::new(HashMap::new()),
                applied: Mutex::new(HashMap::new()),
                devices: Mutex::new(BTreeMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                tasks: Mutex::new(Vec::new()),
                changes,
            }),
        }
    }

    /// Also keep values in `remote` across sessions.
    ///
    /// Has no effect once [`start`](Self::start) was called.
    #[must_use]
    pub fn with_remote(mut self, remote: RemoteStore) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.remote = Some(remote),
            None => tracing::warn!("Broadcast sync already started, remote store ignored"),
        }
        self
    }

    /// This instance's device.
    #[must_use]
    pub fn device(&self) -> &DeviceId {
        &self.inner.device
    }

    /// Load persisted values, announce this device and start the background
    /// tasks. Must be called within a `tokio` runtime.
    pub fn start(&self) {
        self.inner.hydrate();

        let me = DeviceRecord {
            device_id: self.inner.device.clone(),
            display_name: self.inner.name.clone(),
            last_seen: now_ms(),
            is_active: true,
        };
        lock(&self.inner.devices).insert(me.device_id.clone(), me);

        let mut tasks = lock(&self.inner.tasks);
        if let Some(remote) = self.inner.remote.clone() {
            tasks.push(tokio::spawn(Arc::clone(&self.inner).restore_remote(remote)));
        }
        if let Some(bus) = &self.inner.bus {
            let rx = bus.subscribe();
            tasks.push(tokio::spawn(Arc::clone(&self.inner).listen(rx)));
            self.inner.publish_presence(SyncKind::Join);
            tasks.push(tokio::spawn(Arc::clone(&self.inner).heartbeat()));
        } else if self.inner.store.is_some() {
            tracing::info!("No local bus, polling snapshot store");
            tasks.push(tokio::spawn(Arc::clone(&self.inner).poll_store()));
        }

        tracing::info!(device = %self.inner.device, "Broadcast sync started");
    }

    /// Flush pending writes, announce departure and stop every task.
    pub fn shutdown(&self) {
        let pending: Vec<(String, PendingWrite)> = lock(&self.inner.pending).drain().collect();
        for (data_type, write) in pending {
            write.timer.abort();
            self.inner.flush(&data_type, write.operation);
        }

        if self.inner.bus.is_some() {
            self.inner.publish_presence(SyncKind::Leave);
        }

        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        tracing::info!(device = %self.inner.device, "Broadcast sync stopped");
    }

    /// Current value of `data_type`.
    #[must_use]
    pub fn get_data(&self, data_type: &str) -> Option<Value> {
        lock(&self.inner.data)
            .get(data_type)
            .map(|slot| slot.stamped.value.clone())
    }

    /// Last version this instance broadcast for `data_type`.
    #[must_use]
    pub fn version(&self, data_type: &str) -> u64 {
        lock(&self.inner.data)
            .get(data_type)
            .map_or(0, |slot| slot.version)
    }

    /// Replace the local value of `data_type`.
    ///
    /// The value is visible through [`get_data`](Self::get_data) at once;
    /// persisting and broadcasting wait until no further write arrived for
    /// the debounce period. Must be called within a `tokio` runtime.
    pub fn update_data(&self, data_type: &str, value: Value, operation: Option<Operation>) {
        {
            let mut data = lock(&self.inner.data);
            let slot = data.entry(data_type.to_string()).or_insert_with(|| Slot {
                stamped: Stamped::new(Value::Null, 0),
                version: 0,
            });
            slot.stamped = Stamped::new(value, now_ms());
        }

        let generation = {
            let mut next = lock(&self.inner.next_generation);
            *next += 1;
            *next
        };

        // Held across the spawn so the timer cannot look up its entry early.
        let mut pending = lock(&self.inner.pending);
        let inner = Arc::clone(&self.inner);
        let key = data_type.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.config.debounce).await;
            let operation = {
                let mut pending = lock(&inner.pending);
                if !pending
                    .get(&key)
                    .is_some_and(|write| write.generation == generation)
                {
                    return;
                }
                pending.remove(&key).and_then(|write| write.operation)
            };
            inner.flush(&key, operation);
        });

        let operation = match pending.remove(data_type) {
            Some(previous) => {
                previous.timer.abort();
                operation.or(previous.operation)
            }
            None => operation,
        };
        pending.insert(
            data_type.to_string(),
            PendingWrite {
                generation,
                operation,
                timer,
            },
        );
    }

    /// Peers heard from within the staleness window, this device included.
    #[must_use]
    pub fn active_devices(&self) -> Vec<DeviceRecord> {
        self.inner.evict_stale(now_ms());
        lock(&self.inner.devices).values().cloned().collect()
    }

    /// Notifications for values changed by remote writes.
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<DataChange> {
        self.inner.changes.subscribe()
    }

    /// Handle one frame from the bus. Returns whether it changed local data.
    pub fn handle_frame(&self, frame: &[u8]) -> bool {
        self.inner.handle_frame(frame)
    }

    /// Drop peers last seen more than the staleness threshold before `now`
    /// (ms since UNIX epoch). Returns how many were evicted.
    pub fn evict_stale_at(&self, now: i64) -> usize {
        self.inner.evict_stale(now)
    }
}

impl Drop for BroadcastSync {
    fn drop(&mut self) {
        for (_, write) in lock(&self.inner.pending).drain() {
            write.timer.abort();
        }
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Inner {
    fn hydrate(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let rows = match store.load_snapshots() {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to load persisted snapshots");
                return;
            }
        };
        let (own, foreign): (Vec<SnapshotRow>, Vec<SnapshotRow>) = rows
            .into_iter()
            .partition(|row| row.origin_device == self.device);

        {
            let mut data = lock(&self.data);
            for row in own {
                data.insert(
                    row.data_type,
                    Slot {
                        stamped: Stamped::new(row.value, row.updated_at),
                        version: row.version,
                    },
                );
            }
        }
        for row in foreign {
            self.apply_remote(
                &row.origin_device,
                &row.data_type,
                Stamped::new(row.value, row.updated_at),
                row.version,
            );
        }
        tracing::debug!(data_types = lock(&self.data).len(), "Hydrated broadcast data");
    }

    /// Persist and broadcast the current value of `data_type` under a new
    /// version.
    fn flush(&self, data_type: &str, operation: Option<Operation>) {
        let (stamped, version) = {
            let mut data = lock(&self.data);
            let Some(slot) = data.get_mut(data_type) else {
                return;
            };
            slot.version += 1;
            (slot.stamped.clone(), slot.version)
        };

        if let Some(store) = &self.store {
            let row = SnapshotRow {
                data_type: data_type.to_string(),
                value: stamped.value.clone(),
                version,
                origin_device: self.device.clone(),
                updated_at: stamped.updated_at,
            };
            if let Err(err) = store.save_snapshot(&row) {
                tracing::warn!(data_type, error = %err, "Failed to persist snapshot");
            }
        }

        if let Some(remote) = &self.remote {
            self.save_remote(remote, data_type, &stamped);
        }

        if self.bus.is_some() {
            let msg = SyncMessage::data(
                self.device.clone(),
                data_type,
                stamped.value,
                operation,
                version,
                stamped.updated_at,
            );
            self.publish(&msg);
        }

        tracing::debug!(data_type, version, "Flushed broadcast data");
    }

    fn publish(&self, msg: &SyncMessage) {
        let Some(bus) = &self.bus else {
            return;
        };
        match msg.to_json() {
            Ok(frame) => bus.publish(frame),
            Err(err) => tracing::warn!(kind = ?msg.kind, error = %err, "Failed to encode sync message"),
        }
    }

    fn save_remote(&self, remote: &RemoteStore, data_type: &str, stamped: &Stamped) {
        let body = match serde_json::to_value(stamped) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(data_type, error = %err, "Failed to encode snapshot");
                return;
            }
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(data_type, "No runtime, snapshot not saved remotely");
            return;
        };
        let remote = remote.clone();
        let key = snapshot_key(data_type);
        runtime.spawn(async move {
            if let Err(err) = remote.put_field(&key, &body).await {
                tracing::warn!(key, error = %err, "Failed to save snapshot remotely");
            }
        });
    }

    async fn restore_remote(self: Arc<Self>, remote: RemoteStore) {
        let data_types: Vec<String> = self.registry.data_types().map(str::to_string).collect();
        for data_type in data_types {
            let stamped = match remote.get_field(&snapshot_key(&data_type)).await {
                Ok(Some(body)) => match serde_json::from_value::<Stamped>(body) {
                    Ok(stamped) => stamped,
                    Err(err) => {
                        tracing::warn!(data_type, error = %err, "Ignoring malformed remote snapshot");
                        continue;
                    }
                },
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(data_type, error = %err, "Failed to load remote snapshot");
                    continue;
                }
            };
            let value = self.merge_in(&data_type, stamped);
            tracing::debug!(data_type, "Restored remote snapshot");
            let _ = self.changes.send(DataChange {
                data_type,
                value,
                origin_device: self.device.clone(),
            });
        }
    }

    fn publish_presence(&self, kind: SyncKind) {
        self.publish(&SyncMessage::presence(
            kind,
            self.device.clone(),
            &self.name,
            now_ms(),
        ));
    }

    fn handle_frame(&self, frame: &[u8]) -> bool {
        let msg = match SyncMessage::from_json(frame) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(error = %err, len = frame.len(), "Dropping malformed sync message");
                return false;
            }
        };

        if msg.origin_device == self.device {
            return false;
        }

        match msg.kind {
            SyncKind::Data => {
                let Some(data_type) = msg.data_type.clone() else {
                    tracing::warn!(origin = %msg.origin_device, "Data message without data type");
                    return false;
                };
                self.apply_remote(
                    &msg.origin_device,
                    &data_type,
                    Stamped::new(msg.payload, msg.sent_at),
                    msg.version,
                )
            }
            SyncKind::Join | SyncKind::Heartbeat => {
                let name = msg
                    .display_name()
                    .unwrap_or(msg.origin_device.as_str())
                    .to_string();
                let joined = lock(&self.devices)
                    .insert(
                        msg.origin_device.clone(),
                        DeviceRecord {
                            device_id: msg.origin_device.clone(),
                            display_name: name,
                            last_seen: now_ms(),
                            is_active: true,
                        },
                    )
                    .is_none();
                if joined {
                    tracing::info!(device = %msg.origin_device, "Device joined");
                }
                if msg.kind == SyncKind::Join {
                    self.forget_versions(&msg.origin_device);
                }
                false
            }
            SyncKind::Leave => {
                if lock(&self.devices).remove(&msg.origin_device).is_some() {
                    tracing::info!(device = %msg.origin_device, "Device left");
                }
                self.forget_versions(&msg.origin_device);
                false
            }
        }
    }

    /// Versions are counted per sender session.
    fn forget_versions(&self, origin: &DeviceId) {
        lock(&self.applied).retain(|(device, _), _| device != origin);
    }

    fn apply_remote(&self, origin: &DeviceId, data_type: &str, remote: Stamped, version: u64) -> bool {
        {
            let mut applied = lock(&self.applied);
            let key = (origin.clone(), data_type.to_string());
            let last = applied.get(&key).copied().unwrap_or(0);
            if version <= last {
                tracing::debug!(%origin, data_type, version, last, "Ignoring stale version");
                return false;
            }
            applied.insert(key, version);
        }

        let merged = self.merge_in(data_type, remote);

        tracing::debug!(%origin, data_type, version, "Applied remote data");
        let _ = self.changes.send(DataChange {
            data_type: data_type.to_string(),
            value: merged,
            origin_device: origin.clone(),
        });
        true
    }

    /// Merge `remote` into the local value of `data_type`, returning the
    /// result.
    fn merge_in(&self, data_type: &str, remote: Stamped) -> Value {
        let mut data = lock(&self.data);
        match data.get_mut(data_type) {
            Some(slot) => {
                slot.stamped = self.registry.merge(data_type, &slot.stamped, &remote);
                slot.stamped.value.clone()
            }
            None => {
                let value = remote.value.clone();
                data.insert(
                    data_type.to_string(),
                    Slot {
                        stamped: remote,
                        version: 0,
                    },
                );
                value
            }
        }
    }

    fn evict_stale(&self, now: i64) -> usize {
        let threshold = i64::try_from(self.config.stale_after.as_millis()).unwrap_or(i64::MAX);
        let mut devices = lock(&self.devices);
        let before = devices.len();
        devices.retain(|id, record| {
            let fresh = *id == self.device || now.saturating_sub(record.last_seen) <= threshold;
            if !fresh {
                tracing::info!(device = %id, "Evicting stale device");
            }
            fresh
        });
        before - devices.len()
    }

    async fn listen(self: Arc<Self>, mut rx: broadcast::Receiver<Vec<u8>>) {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    self.handle_frame(&frame);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Broadcast listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Some(me) = lock(&self.devices).get_mut(&self.device) {
                me.last_seen = now_ms();
            }
            self.publish_presence(SyncKind::Heartbeat);
            self.evict_stale(now_ms());
        }
    }

    async fn poll_store(self: Arc<Self>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            ticker.tick().await;
            let rows = match store.load_snapshots() {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(error = %err, "Snapshot poll failed");
                    continue;
                }
            };
            for row in rows {
                if row.origin_device == self.device {
                    continue;
                }
                self.apply_remote(
                    &row.origin_device,
                    &row.data_type,
                    Stamped::new(row.value, row.updated_at),
                    row.version,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use opsync_core::MergeStrategy;
    use serde_json::json;

    fn registry() -> MergeRegistry {
        MergeRegistry::new().with("completed", MergeStrategy::SetUnion)
    }

    fn instance(device: &str, bus: &ChannelBus) -> BroadcastSync {
        BroadcastSync::new(
            DeviceId::new(device),
            device.to_uppercase(),
            registry(),
            Some(Arc::new(bus.clone())),
            None,
            BroadcastConfig::default(),
        )
    }

    fn data_messages(rx: &mut broadcast::Receiver<Vec<u8>>) -> Vec<SyncMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let msg = SyncMessage::from_json(&frame).unwrap();
            if msg.kind == SyncKind::Data {
                out.push(msg);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_collapse_into_one_broadcast() {
        let bus = ChannelBus::default();
        let mut rx = bus.subscribe();
        let sync = instance("a", &bus);

        sync.update_data("completed", json!(["t1"]), None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        sync.update_data("completed", json!(["t1", "t2"]), None);
        sync.update_data("completed", json!(["t1", "t2", "t3"]), None);
        assert_eq!(sync.get_data("completed"), Some(json!(["t1", "t2", "t3"])));

        tokio::time::sleep(Duration::from_millis(400)).await;

        let sent = data_messages(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, json!(["t1", "t2", "t3"]));
        assert_eq!(sent[0].version, 1);
        assert_eq!(sync.version("completed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn versions_increase_per_flush() {
        let bus = ChannelBus::default();
        let mut rx = bus.subscribe();
        let sync = instance("a", &bus);

        for value in [json!(["x"]), json!(["x", "y"])] {
            sync.update_data("completed", value, None);
            tokio::time::sleep(Duration::from_millis(400)).await;
        }

        let versions: Vec<u64> = data_messages(&mut rx).iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn peers_converge_through_the_bus() {
        let bus = ChannelBus::default();
        let a = instance("a", &bus);
        let b = instance("b", &bus);
        a.start();
        b.start();

        a.update_data("completed", json!(["t1"]), None);
        b.update_data("completed", json!(["t2"]), None);
        tokio::time::sleep(Duration::from_millis(400)).await;

        for sync in [&a, &b] {
            let mut items: Vec<String> = serde_json::from_value(sync.get_data("completed").unwrap()).unwrap();
            items.sort();
            assert_eq!(items, vec!["t1", "t2"]);
        }

        let names: Vec<String> = a.active_devices().into_iter().map(|d| d.display_name).collect();
        assert_eq!(names, vec!["A", "B"]);

        b.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.active_devices().len(), 1);
        a.shutdown();
    }

    #[test]
    fn stale_or_replayed_versions_are_ignored() {
        let sync = BroadcastSync::new(
            DeviceId::new("a"),
            "A",
            MergeRegistry::new(),
            None,
            None,
            BroadcastConfig::default(),
        );
        let frame = |value: Value, version: u64, sent_at: i64| {
            SyncMessage::data(DeviceId::new("b"), "settings", value, None, version, sent_at)
                .to_json()
                .unwrap()
        };

        assert!(sync.handle_frame(&frame(json!({"theme": "dark"}), 2, 20)));
        assert!(!sync.handle_frame(&frame(json!({"theme": "light"}), 1, 30)));
        assert!(!sync.handle_frame(&frame(json!({"theme": "light"}), 2, 30)));
        assert!(!sync.handle_frame(b"garbage"));
        assert_eq!(sync.get_data("settings"), Some(json!({"theme": "dark"})));

        assert!(sync.handle_frame(&frame(json!({"theme": "light"}), 3, 30)));
        assert_eq!(sync.get_data("settings"), Some(json!({"theme": "light"})));
    }

    #[test]
    fn silent_peers_are_evicted() {
        let sync = BroadcastSync::new(
            DeviceId::new("a"),
            "A",
            MergeRegistry::new(),
            None,
            None,
            BroadcastConfig::default(),
        );
        let heartbeat = SyncMessage::presence(SyncKind::Heartbeat, DeviceId::new("b"), "B", 0)
            .to_json()
            .unwrap();
        sync.handle_frame(&heartbeat);

        let now = now_ms();
        assert_eq!(sync.evict_stale_at(now + 10_000), 0);
        assert_eq!(sync.evict_stale_at(now + 31_000), 1);
        assert!(sync.active_devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn store_polling_replaces_missing_bus() {
        let store = Arc::new(MemoryStore::new());
        let make = |device: &str| {
            BroadcastSync::new(
                DeviceId::new(device),
                device,
                registry(),
                None,
                Some(Arc::clone(&store) as Arc<dyn SnapshotStore>),
                BroadcastConfig::default(),
            )
        };
        let writer = make("a");
        let reader = make("b");
        reader.start();

        writer.update_data("completed", json!(["t1"]), None);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(reader.get_data("completed"), Some(json!(["t1"])));
        reader.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_writers_converge_through_the_store() {
        let store = Arc::new(MemoryStore::new());
        let make = |device: &str| {
            BroadcastSync::new(
                DeviceId::new(device),
                device,
                registry(),
                None,
                Some(Arc::clone(&store) as Arc<dyn SnapshotStore>),
                BroadcastConfig::default(),
            )
        };
        let a = make("a");
        let b = make("b");
        a.start();
        b.start();

        a.update_data("completed", json!(["t1"]), None);
        b.update_data("completed", json!(["t2"]), None);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(a.get_data("completed"), Some(json!(["t1", "t2"])));
        assert_eq!(a.get_data("completed"), b.get_data("completed"));

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn restarted_peer_is_heard_again() {
        let bus = ChannelBus::default();
        let a = instance("a", &bus);
        a.start();

        let b = instance("b", &bus);
        b.start();
        for value in [json!(["t1"]), json!(["t1", "t2"])] {
            b.update_data("completed", value, None);
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
        b.shutdown();
        drop(b);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let b = instance("b", &bus);
        b.start();
        b.update_data("completed", json!(["t9"]), None);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(b.version("completed"), 1);

        assert_eq!(a.get_data("completed"), Some(json!(["t1", "t2", "t9"])));
        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn unreachable_remote_store_leaves_local_sync_working() {
        let store = Arc::new(MemoryStore::new());
        let remote = RemoteStore::new(opsync_remote::RemoteStoreConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_millis(200),
            bearer_token: None,
        })
        .unwrap();
        let sync = BroadcastSync::new(
            DeviceId::new("a"),
            "A",
            registry(),
            None,
            Some(Arc::clone(&store) as Arc<dyn SnapshotStore>),
            BroadcastConfig {
                debounce: Duration::from_millis(10),
                ..BroadcastConfig::default()
            },
        )
        .with_remote(remote);
        sync.start();

        sync.update_data("completed", json!(["t1"]), None);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(sync.get_data("completed"), Some(json!(["t1"])));
        assert_eq!(store.load_snapshots().unwrap().len(), 1);
        sync.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_writes() {
        let store = Arc::new(MemoryStore::new());
        let sync = BroadcastSync::new(
            DeviceId::new("a"),
            "A",
            registry(),
            None,
            Some(Arc::clone(&store) as Arc<dyn SnapshotStore>),
            BroadcastConfig::default(),
        );

        sync.update_data("completed", json!(["t1"]), None);
        sync.shutdown();

        let rows = store.load_snapshots().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version, 1);
    }
}
