//! Protocol messages exchanged between devices.
//!
//! Everything on the wire is JSON.

use chrono::{DateTime, Utc};
use opsync_core::{DeviceId, Operation, Priority};
use serde::{Deserialize, Serialize};

/// An operation in flight over the transport channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEnvelope {
    /// The replicated operation
    pub operation: Operation,
    /// Priority the sender assigned
    pub priority: Priority,
    /// Time the frame left the sender
    pub sent_at: DateTime<Utc>,
}

impl OperationEnvelope {
    /// Wrap an operation for sending now.
    #[must_use]
    pub fn new(operation: Operation, priority: Priority) -> Self {
        Self {
            operation,
            priority,
            sent_at: Utc::now(),
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Kind of a broadcast sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    /// A whole-value snapshot of one data type
    Data,
    /// A device announced itself
    Join,
    /// Periodic liveness signal
    Heartbeat,
    /// A device shut down cleanly
    Leave,
}

/// Message exchanged by broadcast merge sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Message kind
    pub kind: SyncKind,
    /// Data type of the snapshot (data messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    /// Snapshot for data messages, display name for presence messages
    pub payload: serde_json::Value,
    /// Operation that produced the snapshot, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    /// Per-data-type version, strictly increasing on the sender
    pub version: u64,
    /// Sending device
    pub origin_device: DeviceId,
    /// Send time in milliseconds since UNIX epoch
    pub sent_at: i64,
}

impl SyncMessage {
    /// Build a data message.
    #[must_use]
    pub fn data(
        origin_device: DeviceId,
        data_type: impl Into<String>,
        payload: serde_json::Value,
        operation: Option<Operation>,
        version: u64,
        sent_at: i64,
    ) -> Self {
        Self {
            kind: SyncKind::Data,
            data_type: Some(data_type.into()),
            payload,
            operation,
            version,
            origin_device,
            sent_at,
        }
    }

    /// Build a presence message carrying the device's display name.
    #[must_use]
    pub fn presence(kind: SyncKind, origin_device: DeviceId, display_name: &str, sent_at: i64) -> Self {
        Self {
            kind,
            data_type: None,
            payload: serde_json::json!({ "name": display_name }),
            operation: None,
            version: 0,
            origin_device,
            sent_at,
        }
    }

    /// Display name carried by a presence message.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.payload.get("name").and_then(serde_json::Value::as_str)
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// A peer seen through presence messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device identifier
    pub device_id: DeviceId,
    /// Human-readable name
    pub display_name: String,
    /// Last time a presence message arrived (ms since UNIX epoch)
    pub last_seen: i64,
    /// Whether the device is considered alive
    pub is_active: bool,
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_core::{ClockSnapshot, Collection, OperationKind, Record};
    use uuid::Uuid;

    fn sample_operation() -> Operation {
        Operation::from_parts(
            Uuid::new_v4(),
            OperationKind::Complete,
            Record::new("task-1"),
            Utc::now(),
            DeviceId::new("tablet"),
            ClockSnapshot::from_entries([("tablet", 4)]),
            Collection::Tasks,
            4,
        )
    }

    #[test]
    fn envelope_json_roundtrip() {
        let envelope = OperationEnvelope::new(sample_operation(), Priority::Critical);

        let bytes = envelope.to_json().unwrap();
        let decoded = OperationEnvelope::from_json(&bytes).unwrap();

        assert_eq!(decoded, envelope);
    }

    #[test]
    fn envelope_rejects_garbage() {
        let err = OperationEnvelope::from_json(b"{not json").unwrap_err();
        assert!(matches!(err, MessageError::Deserialize(_)));
    }

    #[test]
    fn sync_message_wire_fields() {
        let msg = SyncMessage::data(
            DeviceId::new("laptop"),
            "completed",
            serde_json::json!(["t1"]),
            None,
            3,
            1_700_000_000_000,
        );
        let json: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["kind"], "data");
        assert_eq!(json["data_type"], "completed");
        assert_eq!(json["version"], 3);
        assert_eq!(json["origin_device"], "laptop");
        assert!(json.get("operation").is_none());
    }

    #[test]
    fn presence_carries_name() {
        let msg = SyncMessage::presence(SyncKind::Heartbeat, DeviceId::new("p"), "Phone", 1);
        let decoded = SyncMessage::from_json(&msg.to_json().unwrap()).unwrap();

        assert_eq!(decoded.display_name(), Some("Phone"));
    }
}
