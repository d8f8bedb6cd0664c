//! Agent runtime orchestration.

use crate::broadcast::BroadcastSync;
use crate::config::AgentConfig;
use crate::mqtt::MqttConnector;
use crate::persistence::{SnapshotStore, SqliteStore};
use crate::queue::{DrainReport, OfflineQueue};
use crate::transport::{ChannelState, Connector, Delivery, TransportChannel};
use anyhow::{anyhow, Context, Result};
use opsync_core::{
    Collection, Dataset, DeviceId, LogicalClock, MergeRegistry, MergeStrategy, Operation,
    OperationKind, OperationManager, Outcome, Record, SyncError,
};
use opsync_proto::TopicScheme;
use opsync_remote::RemoteStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

/// Collections reloaded from the remote store at startup.
const RELOADED_COLLECTIONS: [Collection; 3] =
    [Collection::Tasks, Collection::Schedules, Collection::Inventory];

/// Broadcast data type listing the ids of completed tasks.
pub const COMPLETED_TASKS: &str = "completed_tasks";

/// Pick the device id: configured, else persisted, else a fresh UUID.
///
/// The chosen id is persisted so later runs keep it.
///
/// # Errors
///
/// Returns error if the identity table cannot be read or written.
pub fn resolve_device_id(configured: Option<&str>, store: &SqliteStore) -> Result<DeviceId> {
    let device = match configured {
        Some(id) => DeviceId::new(id),
        None => match store.load_device_id()? {
            Some(id) => id,
            None => {
                let id = DeviceId::new(Uuid::new_v4().to_string());
                tracing::info!(device = %id, "Generated new device id");
                id
            }
        },
    };
    store.save_device_id(&device)?;
    Ok(device)
}

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    store: Arc<SqliteStore>,
    manager: OperationManager,
    queue: OfflineQueue<Arc<SqliteStore>>,
    remote: Option<RemoteStore>,
    views: BroadcastSync,
    state: Dataset,
}

impl Agent {
    /// Create a new agent backed by the configured database.
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.persistence.db_path)
            .context("Failed to open SQLite database")?;
        Self::with_store(config, Arc::new(store))
    }

    /// Create a new agent on an already opened store.
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails.
    pub fn with_store(config: AgentConfig, store: Arc<SqliteStore>) -> Result<Self> {
        let device = resolve_device_id(config.device.id.as_deref(), &store)?;
        let clock = store
            .load_clock()
            .context("Failed to load device clock")?
            .unwrap_or_default();
        tracing::info!(%device, %clock, "Device identity resolved");

        let manager = OperationManager::with_clock(LogicalClock::restore(device.clone(), clock));
        let queue = OfflineQueue::open(Arc::clone(&store), config.queue.clone())
            .context("Failed to open offline queue")?;
        let remote = config
            .remote
            .clone()
            .map(RemoteStore::new)
            .transpose()
            .context("Failed to create remote store client")?;

        // Co-located processes share the database file, so views travel
        // through its snapshot table.
        let mut views = BroadcastSync::new(
            device,
            config.device.name.clone(),
            MergeRegistry::new().with(COMPLETED_TASKS, MergeStrategy::SetUnion),
            None,
            Some(Arc::clone(&store) as Arc<dyn SnapshotStore>),
            config.broadcast.clone(),
        );
        if let Some(remote) = &remote {
            views = views.with_remote(remote.clone());
        }

        Ok(Self {
            config,
            store,
            manager,
            queue,
            remote,
            views,
            state: Dataset::new(),
        })
    }

    /// This agent's device.
    #[must_use]
    pub fn device(&self) -> &DeviceId {
        self.manager.device()
    }

    /// Current local view of the data.
    #[must_use]
    pub fn state(&self) -> &Dataset {
        &self.state
    }

    /// Whole-value views shared with processes on this host.
    #[must_use]
    pub fn views(&self) -> &BroadcastSync {
        &self.views
    }

    /// Pending operations.
    #[must_use]
    pub fn queue(&self) -> &OfflineQueue<Arc<SqliteStore>> {
        &self.queue
    }

    fn persist_clock(&self) {
        if let Err(err) = self.store.save_clock(&self.manager.clock().get_clock()) {
            tracing::warn!(error = %err, "Failed to persist device clock");
        }
    }

    /// Record a local change: stamp it, apply it optimistically and queue it
    /// for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingEntity`] if the change refers to a record
    /// that does not exist, [`SyncError::DuplicateEntity`] if it creates one
    /// that does.
    pub fn record(
        &mut self,
        kind: OperationKind,
        payload: Record,
        target: Collection,
    ) -> Result<Operation, SyncError> {
        let op = self
            .manager
            .checked_operation(kind, payload, target, &self.state)?;
        self.persist_clock();

        let applied = self.manager.apply_operation(&op, &self.state);
        self.state = applied.state;
        self.queue.enqueue(op.clone());
        Ok(op)
    }

    /// Apply an operation received from another device.
    ///
    /// Returns `None` for operations that originated here.
    pub fn receive(&mut self, op: &Operation) -> Option<Outcome> {
        if op.origin_device() == self.device() {
            return None;
        }

        self.manager.observe(op);
        self.persist_clock();

        let applied = self.manager.apply_operation(op, &self.state);
        tracing::debug!(
            op_id = %op.id(),
            origin = %op.origin_device(),
            outcome = ?applied.outcome,
            "Applied remote operation"
        );
        self.state = applied.state;
        Some(applied.outcome)
    }

    /// Publish the views derived from the current state.
    ///
    /// Must be called within a `tokio` runtime.
    pub fn publish_views(&self, cause: Option<Operation>) {
        let completed: Vec<&str> = self
            .state
            .records(&Collection::Tasks)
            .filter(|record| record.completed)
            .map(|record| record.id.as_str())
            .collect();
        self.views
            .update_data(COMPLETED_TASKS, serde_json::json!(completed), cause);
    }

    /// Rebuild local state from the remote operation log and the local
    /// queue.
    ///
    /// Returns the number of entities that ended up with a winning operation.
    ///
    /// # Errors
    ///
    /// Returns error if no remote store is configured or it cannot be read.
    pub async fn bulk_reload(&mut self, collections: &[Collection]) -> Result<usize> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| anyhow!("No remote store configured"))?;

        let mut log = Vec::new();
        for collection in collections {
            let ops = remote
                .load_operations(collection)
                .await
                .with_context(|| format!("Failed to load operation log for {collection}"))?;
            log.extend(ops);
        }

        let mut seen = HashSet::new();
        let mut ops: Vec<Operation> = log
            .into_iter()
            .chain(self.queue.entries().iter().map(|e| e.operation.clone()))
            .filter(|op| seen.insert(op.id()))
            .collect();

        for op in &ops {
            self.manager.observe(op);
        }
        self.persist_clock();

        ops.sort_by(|a, b| {
            (a.created_at(), a.origin_device(), a.id())
                .cmp(&(b.created_at(), b.origin_device(), b.id()))
        });
        let total = ops.len();
        let replayed = self.manager.apply_all(&ops, &Dataset::new());
        let winners = self.manager.resolve_conflicts(ops);
        self.state = self.manager.apply_all(&winners, &replayed);

        tracing::info!(
            operations = total,
            winners = winners.len(),
            records = self.state.len(),
            "Bulk reload complete"
        );
        Ok(winners.len())
    }

    /// One drain pass: expire, compact, then deliver the queue.
    ///
    /// Operations go to the peer over `channel` when it is connected. With a
    /// remote store, its acknowledgement is what removes an entry; without
    /// one, the link's acknowledgement of the send to the peer does.
    pub async fn drain_to<C: Connector>(&mut self, channel: &TransportChannel<C>) -> DrainReport {
        let expired = self.queue.clean_expired_operations(self.config.queue.ttl);
        if expired > 0 {
            tracing::info!(expired, "Expired queued operations");
        }
        if let Err(err) = self.queue.compact_operation_log() {
            tracing::warn!(error = %err, "Queue compaction failed");
        }

        let remote = self.remote.clone();
        self.queue
            .process_queue(|op| {
                let remote = remote.clone();
                async move {
                    let peer = if channel.state() == ChannelState::Connected {
                        channel.send_operation(&op, op.priority()).await
                    } else {
                        Ok(Delivery::Buffered)
                    };

                    match remote {
                        Some(remote) => remote.append_operation(&op).await.map_err(anyhow::Error::from),
                        None => match peer {
                            Ok(Delivery::Sent) => Ok(()),
                            Ok(Delivery::Buffered) => Err(anyhow!("peer unreachable")),
                            Err(err) => Err(err.into()),
                        },
                    }
                }
            })
            .await
    }

    /// Run the agent's main loop.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be configured.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(device = %self.device(), "Starting agent runtime");
        self.views.start();

        let scheme = TopicScheme::new(&self.config.transport.tenant);
        let peer = self.config.transport.peer_id.as_deref().map(DeviceId::new);
        let connector = MqttConnector::new(
            &self.config.transport.mqtt_broker,
            self.device(),
            peer.as_ref(),
            &scheme,
        )
        .context("Failed to configure MQTT transport")?;

        let channel = TransportChannel::new(connector, self.config.transport.channel.clone());
        let mut inbound = channel.subscribe();
        if let Err(err) = channel.connect().await {
            tracing::warn!(error = %err, "Initial connection failed, retrying in background");
        }

        if self.remote.is_some() {
            if let Err(err) = self.bulk_reload(&RELOADED_COLLECTIONS).await {
                tracing::warn!(error = %err, "Bulk reload failed, continuing with local state");
            }
        }
        self.publish_views(None);

        let mut drain = tokio::time::interval(self.config.drain_interval);

        tracing::info!("Agent running, press Ctrl+C to stop");

        loop {
            tokio::select! {
                _ = drain.tick() => {
                    if !self.queue.is_empty() {
                        self.drain_to(&channel).await;
                    }
                }

                received = inbound.recv() => {
                    match received {
                        Ok(envelope) => {
                            if self.receive(&envelope.operation) == Some(Outcome::Changed) {
                                self.publish_views(Some(envelope.operation));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Inbound operations dropped, reload recommended");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        channel.close().await;
        self.views.shutdown();
        tracing::info!(pending = self.queue.len(), "Agent stopped");
        Ok(())
    }
}
