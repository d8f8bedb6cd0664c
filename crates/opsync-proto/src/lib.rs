//! # opsync Protocol
//!
//! Wire messages and MQTT topic scheme.
//!
//! ## Messages
//!
//! - `OperationEnvelope`: one operation on the transport channel
//! - `SyncMessage`: whole-value snapshots and presence for broadcast sync
//! - `DeviceRecord`: a peer known through presence
//!
//! ## MQTT Topics
//!
//! Topic scheme: `opsync/v1/{tenant}/...`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{DeviceRecord, MessageError, OperationEnvelope, SyncKind, SyncMessage};
pub use topics::TopicScheme;
