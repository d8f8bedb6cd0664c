//! # opsync Agent
//!
//! Offline-first synchronization runtime for one device.
//!
//! ## Architecture
//!
//! - **Queue**: every local operation is written through to `SQLite` and
//!   drained by priority until the remote store acknowledges it
//! - **Transport**: a reconnecting MQTT channel to peers with exponential
//!   backoff and a priority-ordered buffer
//! - **Broadcast**: whole-value views shared with processes on one host
//! - **Runtime**: wires the above around one `OperationManager`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod config;
pub mod mqtt;
pub mod persistence;
pub mod queue;
pub mod runtime;
pub mod transport;

pub use broadcast::{BroadcastConfig, BroadcastSync, ChannelBus, DataChange, LocalBus};
pub use config::AgentConfig;
pub use mqtt::MqttConnector;
pub use persistence::{MemoryStore, OperationStore, SnapshotRow, SnapshotStore, SqliteStore, StoreError};
pub use queue::{DrainReport, Durability, OfflineQueue, QueueConfig, QueueEntry, QueueError};
pub use runtime::{resolve_device_id, Agent, COMPLETED_TASKS};
pub use transport::{
    Backoff, ChannelState, Connector, Delivery, FrameSink, FrameStream, TransportChannel,
    TransportConfig, TransportError,
};
