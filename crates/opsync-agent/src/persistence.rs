//! Local persistence for queued operations, device identity and broadcast
//! snapshots.
//!
//! Queue entries are stored as CBOR blobs so the on-disk layout does not
//! depend on the JSON wire format.

use crate::queue::QueueEntry;
use opsync_core::{ClockSnapshot, DeviceId};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Durable backing for the offline queue.
pub trait OperationStore: Send + Sync {
    /// Insert or overwrite one entry.
    ///
    /// # Errors
    ///
    /// Returns error if the entry cannot be written.
    fn put(&self, entry: &QueueEntry) -> Result<(), StoreError>;

    /// Load every entry in insertion order.
    ///
    /// # Errors
    ///
    /// Returns error if the entries cannot be read.
    fn load_all(&self) -> Result<Vec<QueueEntry>, StoreError>;

    /// Delete one entry by operation id. Deleting a missing entry is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    fn delete(&self, op_id: Uuid) -> Result<(), StoreError>;

    /// Delete every entry.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    fn clear(&self) -> Result<(), StoreError>;

    /// Atomically replace the stored entries with `entries`.
    ///
    /// # Errors
    ///
    /// Returns error if the rewrite fails; the previous contents are kept.
    fn replace_all(&self, entries: &[QueueEntry]) -> Result<(), StoreError>;
}

impl<T: OperationStore + ?Sized> OperationStore for Arc<T> {
    fn put(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        (**self).put(entry)
    }

    fn load_all(&self) -> Result<Vec<QueueEntry>, StoreError> {
        (**self).load_all()
    }

    fn delete(&self, op_id: Uuid) -> Result<(), StoreError> {
        (**self).delete(op_id)
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }

    fn replace_all(&self, entries: &[QueueEntry]) -> Result<(), StoreError> {
        (**self).replace_all(entries)
    }
}

/// Latest value one device wrote for a broadcast data type.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    /// Data type name
    pub data_type: String,
    /// Whole value
    pub value: Value,
    /// Sender version of the write
    pub version: u64,
    /// Device that wrote the row
    pub origin_device: DeviceId,
    /// Write time in milliseconds since UNIX epoch
    pub updated_at: i64,
}

/// Shared snapshot table used by broadcast sync.
pub trait SnapshotStore: Send + Sync {
    /// Insert or overwrite the row for `row.data_type` written by
    /// `row.origin_device`.
    ///
    /// # Errors
    ///
    /// Returns error if the row cannot be written.
    fn save_snapshot(&self, row: &SnapshotRow) -> Result<(), StoreError>;

    /// Load every stored row.
    ///
    /// # Errors
    ///
    /// Returns error if the rows cannot be read.
    fn load_snapshots(&self) -> Result<Vec<SnapshotRow>, StoreError>;
}

/// `SQLite`-backed persistence store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r"
            -- Pending operations, oldest first
            CREATE TABLE IF NOT EXISTS queue_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                op_id TEXT NOT NULL UNIQUE,
                entry_bytes BLOB NOT NULL,
                enqueued_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_entries_enqueued ON queue_entries(enqueued_at);

            -- Identity of this installation
            CREATE TABLE IF NOT EXISTS device_identity (
                singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
                device_id TEXT NOT NULL,
                clock_json TEXT
            );

            -- Latest value per broadcast data type and writer
            CREATE TABLE IF NOT EXISTS snapshots (
                data_type TEXT NOT NULL,
                origin_device TEXT NOT NULL,
                value_json TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (data_type, origin_device)
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Device id persisted by an earlier run.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn load_device_id(&self) -> Result<Option<DeviceId>, StoreError> {
        let id: Option<String> = self
            .conn()
            .query_row(
                "SELECT device_id FROM device_identity WHERE singleton = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(DeviceId::new))
    }

    /// Persist the device id. A different id resets the stored clock.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub fn save_device_id(&self, device: &DeviceId) -> Result<(), StoreError> {
        self.conn().execute(
            r"
            INSERT INTO device_identity (singleton, device_id, clock_json) VALUES (1, ?1, NULL)
            ON CONFLICT(singleton) DO UPDATE SET
                clock_json = CASE WHEN device_id = excluded.device_id THEN clock_json ELSE NULL END,
                device_id = excluded.device_id
            ",
            [device.as_str()],
        )?;
        Ok(())
    }

    /// Clock persisted for this device.
    ///
    /// # Errors
    ///
    /// Returns error if query fails or the stored clock does not decode.
    pub fn load_clock(&self) -> Result<Option<ClockSnapshot>, StoreError> {
        let json: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT clock_json FROM device_identity WHERE singleton = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        json.flatten()
            .map(|json| serde_json::from_str(&json).map_err(|e| StoreError::Decode(e.to_string())))
            .transpose()
    }

    /// Persist the device clock.
    ///
    /// # Errors
    ///
    /// Returns error if the device id was never saved or the update fails.
    pub fn save_clock(&self, clock: &ClockSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_string(clock).map_err(|e| StoreError::Encode(e.to_string()))?;
        let updated = self.conn().execute(
            "UPDATE device_identity SET clock_json = ?1 WHERE singleton = 1",
            [json],
        )?;
        if updated == 0 {
            return Err(StoreError::MissingIdentity);
        }
        Ok(())
    }
}

impl OperationStore for SqliteStore {
    fn put(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let bytes = encode_entry(entry)?;
        self.conn().execute(
            r"
            INSERT INTO queue_entries (op_id, entry_bytes, enqueued_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(op_id) DO UPDATE SET
                entry_bytes = excluded.entry_bytes,
                enqueued_at = excluded.enqueued_at
            ",
            (
                entry.operation.id().to_string(),
                bytes,
                entry.enqueued_at.timestamp_millis(),
            ),
        )?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT entry_bytes FROM queue_entries ORDER BY seq ASC")?;

        let blobs = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        blobs.iter().map(|bytes| decode_entry(bytes)).collect()
    }

    fn delete(&self, op_id: Uuid) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM queue_entries WHERE op_id = ?1",
            [op_id.to_string()],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.conn().execute("DELETE FROM queue_entries", [])?;
        Ok(())
    }

    fn replace_all(&self, entries: &[QueueEntry]) -> Result<(), StoreError> {
        let encoded = entries
            .iter()
            .map(|entry| Ok((entry, encode_entry(entry)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM queue_entries", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO queue_entries (op_id, entry_bytes, enqueued_at) VALUES (?1, ?2, ?3)",
            )?;
            for (entry, bytes) in encoded {
                stmt.execute((
                    entry.operation.id().to_string(),
                    bytes,
                    entry.enqueued_at.timestamp_millis(),
                ))?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl SnapshotStore for SqliteStore {
    fn save_snapshot(&self, row: &SnapshotRow) -> Result<(), StoreError> {
        let value =
            serde_json::to_string(&row.value).map_err(|e| StoreError::Encode(e.to_string()))?;
        self.conn().execute(
            r"
            INSERT OR REPLACE INTO snapshots (data_type, value_json, version, origin_device, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            (
                row.data_type.as_str(),
                value,
                to_i64(row.version)?,
                row.origin_device.as_str(),
                row.updated_at,
            ),
        )?;
        Ok(())
    }

    fn load_snapshots(&self) -> Result<Vec<SnapshotRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT data_type, value_json, version, origin_device, updated_at FROM snapshots",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(data_type, value, version, origin, updated_at)| {
                Ok(SnapshotRow {
                    data_type,
                    value: serde_json::from_str(&value)
                        .map_err(|e| StoreError::Decode(e.to_string()))?,
                    version: u64::try_from(version)
                        .map_err(|e| StoreError::Decode(e.to_string()))?,
                    origin_device: DeviceId::new(origin),
                    updated_at,
                })
            })
            .collect()
    }
}

/// Volatile store for tests and ephemeral devices.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<QueueEntry>>,
    snapshots: Mutex<BTreeMap<(String, DeviceId), SnapshotRow>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OperationStore for MemoryStore {
    fn put(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        match entries
            .iter_mut()
            .find(|e| e.operation.id() == entry.operation.id())
        {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<QueueEntry>, StoreError> {
        Ok(lock(&self.entries).clone())
    }

    fn delete(&self, op_id: Uuid) -> Result<(), StoreError> {
        lock(&self.entries).retain(|e| e.operation.id() != op_id);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        lock(&self.entries).clear();
        Ok(())
    }

    fn replace_all(&self, entries: &[QueueEntry]) -> Result<(), StoreError> {
        *lock(&self.entries) = entries.to_vec();
        Ok(())
    }
}

impl SnapshotStore for MemoryStore {
    fn save_snapshot(&self, row: &SnapshotRow) -> Result<(), StoreError> {
        lock(&self.snapshots).insert(
            (row.data_type.clone(), row.origin_device.clone()),
            row.clone(),
        );
        Ok(())
    }

    fn load_snapshots(&self) -> Result<Vec<SnapshotRow>, StoreError> {
        Ok(lock(&self.snapshots).values().cloned().collect())
    }
}

fn encode_entry(entry: &QueueEntry) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(entry, &mut bytes).map_err(|e| StoreError::Encode(e.to_string()))?;
    Ok(bytes)
}

fn decode_entry(bytes: &[u8]) -> Result<QueueEntry, StoreError> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Decode(e.to_string()))
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|e| StoreError::Encode(e.to_string()))
}

/// Errors raised by local persistence.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The database rejected a statement
    #[error("sqlite error: {0}")]
    Sqlite(String),
    /// A value could not be encoded for storage
    #[error("encode error: {0}")]
    Encode(String),
    /// A stored value could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
    /// The device identity row does not exist yet
    #[error("device identity not initialized")]
    MissingIdentity,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use opsync_core::{Collection, OperationKind, OperationManager, Record};

    fn entry(manager: &mut OperationManager, id: &str, name: &str) -> QueueEntry {
        QueueEntry::new(
            manager.create_operation(
                OperationKind::Create,
                Record::new(id).with_field("name", serde_json::json!(name)),
                Collection::Tasks,
            ),
            Utc::now(),
        )
    }

    #[test]
    fn queue_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let mut manager = OperationManager::new(DeviceId::new("a"));
        let first = entry(&mut manager, "1", "dishes");
        let second = entry(&mut manager, "2", "laundry");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(&first).unwrap();
            store.put(&second).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].operation, first.operation);
        assert_eq!(loaded[1].operation, second.operation);

        store.delete(first.operation.id()).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);

        store.clear().unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn replace_all_rewrites_contents() {
        let store = SqliteStore::in_memory().unwrap();
        let mut manager = OperationManager::new(DeviceId::new("a"));
        let kept = entry(&mut manager, "1", "kept");

        store.put(&entry(&mut manager, "2", "dropped")).unwrap();
        store.put(&entry(&mut manager, "3", "dropped")).unwrap();
        store.replace_all(std::slice::from_ref(&kept)).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].operation, kept.operation);
    }

    #[test]
    fn device_identity_and_clock() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.load_device_id().unwrap().is_none());
        assert!(matches!(
            store.save_clock(&ClockSnapshot::default()),
            Err(StoreError::MissingIdentity)
        ));

        let device = DeviceId::new("phone");
        store.save_device_id(&device).unwrap();
        let clock = ClockSnapshot::from_entries([("phone", 3), ("tablet", 1)]);
        store.save_clock(&clock).unwrap();

        assert_eq!(store.load_device_id().unwrap(), Some(device.clone()));
        assert_eq!(store.load_clock().unwrap(), Some(clock.clone()));

        store.save_device_id(&device).unwrap();
        assert_eq!(store.load_clock().unwrap(), Some(clock));

        store.save_device_id(&DeviceId::new("other")).unwrap();
        assert!(store.load_clock().unwrap().is_none());
    }

    #[test]
    fn snapshots_keep_one_row_per_writer() {
        let store = SqliteStore::in_memory().unwrap();
        let row = SnapshotRow {
            data_type: "completed".to_string(),
            value: serde_json::json!(["t1"]),
            version: 1,
            origin_device: DeviceId::new("a"),
            updated_at: 10,
        };
        store.save_snapshot(&row).unwrap();
        store
            .save_snapshot(&SnapshotRow {
                value: serde_json::json!(["t1", "t2"]),
                version: 2,
                updated_at: 20,
                ..row.clone()
            })
            .unwrap();
        store
            .save_snapshot(&SnapshotRow {
                value: serde_json::json!(["t9"]),
                origin_device: DeviceId::new("b"),
                ..row.clone()
            })
            .unwrap();

        let mut rows = store.load_snapshots().unwrap();
        rows.sort_by(|x, y| x.origin_device.cmp(&y.origin_device));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].version, 2);
        assert_eq!(rows[0].value, serde_json::json!(["t1", "t2"]));
        assert_eq!(rows[1].value, serde_json::json!(["t9"]));
    }

    #[test]
    fn memory_store_put_overwrites_by_id() {
        let store = MemoryStore::new();
        let mut manager = OperationManager::new(DeviceId::new("a"));
        let mut first = entry(&mut manager, "1", "x");

        store.put(&first).unwrap();
        first.enqueued_at = Utc::now();
        store.put(&first).unwrap();

        assert_eq!(store.load_all().unwrap().len(), 1);
    }
}
