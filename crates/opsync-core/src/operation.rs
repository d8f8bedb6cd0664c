//! Operations: the unit of replication.
//!
//! An [`Operation`] records one mutation against one entity of one
//! collection, together with the clock snapshot of the device that made it.
//! Operations are immutable once created; every device applies them,
//! including the originator.

use crate::clock::{ClockSnapshot, DeviceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of mutation carried by an operation.
///
/// Unknown kinds produced by newer devices deserialize into
/// [`OperationKind::Custom`] instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    /// Insert a new record
    Create,
    /// Replace an existing record
    Update,
    /// Mark an existing record as completed
    Complete,
    /// Remove an existing record
    Delete,
    /// Any kind this build does not understand
    Custom(String),
}

impl OperationKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Complete => "complete",
            OperationKind::Delete => "delete",
            OperationKind::Custom(name) => name,
        }
    }

    /// Delivery priority class for this kind.
    #[must_use]
    pub fn priority(&self) -> Priority {
        match self {
            OperationKind::Complete | OperationKind::Delete => Priority::Critical,
            OperationKind::Create | OperationKind::Update => Priority::Normal,
            OperationKind::Custom(_) => Priority::Background,
        }
    }
}

impl From<String> for OperationKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "create" => OperationKind::Create,
            "update" => OperationKind::Update,
            "complete" => OperationKind::Complete,
            "delete" => OperationKind::Delete,
            _ => OperationKind::Custom(value),
        }
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority, ordered from most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Sent first, one at a time
    Critical,
    /// Sent as a concurrent batch
    Normal,
    /// Sent last with a staggered delay
    Background,
}

impl Priority {
    /// All classes in delivery order.
    pub const ORDER: [Priority; 3] = [Priority::Critical, Priority::Normal, Priority::Background];
}

/// Collection an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Collection {
    /// Completable to-do items
    Tasks,
    /// Calendar-like entries
    Schedules,
    /// Stock records
    Inventory,
    /// A collection this build does not understand
    Other(String),
}

impl Collection {
    /// Wire name of the collection.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Collection::Tasks => "tasks",
            Collection::Schedules => "schedules",
            Collection::Inventory => "inventory",
            Collection::Other(name) => name,
        }
    }
}

impl From<String> for Collection {
    fn from(value: String) -> Self {
        match value.as_str() {
            "tasks" => Collection::Tasks,
            "schedules" => Collection::Schedules,
            "inventory" => Collection::Inventory,
            _ => Collection::Other(value),
        }
    }
}

impl From<Collection> for String {
    fn from(collection: Collection) -> Self {
        collection.as_str().to_string()
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored entity. Payloads always carry the full record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Entity identifier, unique within its collection
    pub id: String,
    /// Completion flag toggled by `complete` operations
    #[serde(default)]
    pub completed: bool,
    /// Caller-defined fields
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    /// Create a record with no extra fields.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            completed: false,
            fields: serde_json::Map::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Key that conflict resolution and compaction group by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Target collection
    pub collection: Collection,
    /// Entity identifier
    pub id: String,
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// An immutable, causally stamped mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    id: Uuid,
    kind: OperationKind,
    payload: Record,
    created_at: DateTime<Utc>,
    origin_device: DeviceId,
    clock: ClockSnapshot,
    target: Collection,
    origin_version: u64,
}

impl Operation {
    /// Assemble an operation from its parts.
    ///
    /// Local mutations should go through
    /// [`OperationManager`](crate::manager::OperationManager), which stamps
    /// the clock consistently; this constructor exists for decoding and
    /// tests.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: Uuid,
        kind: OperationKind,
        payload: Record,
        created_at: DateTime<Utc>,
        origin_device: DeviceId,
        clock: ClockSnapshot,
        target: Collection,
        origin_version: u64,
    ) -> Self {
        Self {
            id,
            kind,
            payload,
            created_at,
            origin_device,
            clock,
            target,
            origin_version,
        }
    }

    /// Unique operation identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Mutation kind.
    #[must_use]
    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    /// The record carried by the operation.
    #[must_use]
    pub fn payload(&self) -> &Record {
        &self.payload
    }

    /// Wall-clock creation time on the originating device.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Device that created the operation.
    #[must_use]
    pub fn origin_device(&self) -> &DeviceId {
        &self.origin_device
    }

    /// Clock snapshot taken right after the originator's increment.
    #[must_use]
    pub fn clock(&self) -> &ClockSnapshot {
        &self.clock
    }

    /// Target collection.
    #[must_use]
    pub fn target(&self) -> &Collection {
        &self.target
    }

    /// The originator's own counter at creation.
    #[must_use]
    pub fn origin_version(&self) -> u64 {
        self.origin_version
    }

    /// Entity this operation touches.
    #[must_use]
    pub fn entity_key(&self) -> EntityKey {
        EntityKey {
            collection: self.target.clone(),
            id: self.payload.id.clone(),
        }
    }

    /// Delivery priority derived from the kind.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.kind.priority()
    }
}
