//! In-memory dataset that operations are applied to.
//!
//! Records are keyed by id within each collection, so two datasets holding
//! the same records compare equal regardless of the order operations
//! reached them in.

use crate::operation::{Collection, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The records of every collection known to a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    collections: BTreeMap<Collection, BTreeMap<String, Record>>,
}

impl Dataset {
    /// Create an empty dataset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records of one collection, ordered by id.
    pub fn records(&self, collection: &Collection) -> impl Iterator<Item = &Record> {
        self.collections
            .get(collection)
            .into_iter()
            .flat_map(BTreeMap::values)
    }

    /// Find a record by id.
    #[must_use]
    pub fn find(&self, collection: &Collection, id: &str) -> Option<&Record> {
        self.collections.get(collection)?.get(id)
    }

    /// Whether a record with `id` exists.
    #[must_use]
    pub fn contains(&self, collection: &Collection, id: &str) -> bool {
        self.find(collection, id).is_some()
    }

    /// Append a record, replacing any record with the same id.
    ///
    /// Returns `true` if the record was new.
    pub fn append(&mut self, collection: &Collection, record: Record) -> bool {
        self.collections
            .entry(collection.clone())
            .or_default()
            .insert(record.id.clone(), record)
            .is_none()
    }

    /// Mutable access to a record by id.
    pub fn find_mut(&mut self, collection: &Collection, id: &str) -> Option<&mut Record> {
        self.collections.get_mut(collection)?.get_mut(id)
    }

    /// Remove a record by id, returning it if present.
    pub fn remove(&mut self, collection: &Collection, id: &str) -> Option<Record> {
        let records = self.collections.get_mut(collection)?;
        let removed = records.remove(id)?;
        if records.is_empty() {
            self.collections.remove(collection);
        }
        Some(removed)
    }

    /// Total number of records across collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    /// Whether the dataset holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_find_remove() {
        let mut data = Dataset::new();
        assert!(data.append(&Collection::Tasks, Record::new("1")));
        assert!(data.append(&Collection::Tasks, Record::new("2")));
        assert!(!data.append(
            &Collection::Tasks,
            Record::new("1").with_field("name", serde_json::json!("X"))
        ));

        assert_eq!(data.len(), 2);
        assert_eq!(
            data.find(&Collection::Tasks, "1").unwrap().fields["name"],
            serde_json::json!("X")
        );
        assert_eq!(data.records(&Collection::Tasks).count(), 2);

        assert!(data.remove(&Collection::Tasks, "1").is_some());
        assert!(data.remove(&Collection::Tasks, "1").is_none());
        data.remove(&Collection::Tasks, "2");

        // Empty collections are dropped so equality stays structural.
        assert_eq!(data, Dataset::new());
        assert!(data.is_empty());
    }
}
