//! Whole-value merge strategies for broadcast synchronization.
//!
//! Co-located processes exchange complete snapshots of a data type instead
//! of operation logs. Each data type is merged with a registered strategy.
//!
//! # Merge Rules
//!
//! | Strategy | Shape | Rule |
//! |----------|-------|------|
//! | SetUnion | array | sorted union, nothing from either side is lost |
//! | KeyedTimestamp | object | per key, the entry with the newer `updated_at` wins |
//! | IdentifiedArray | array of records with `id` | per id, replaced only if strictly newer |
//! | LastWriterWins | any | whole value with the newer snapshot timestamp wins, ties go to the greater value |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Field holding a per-entry timestamp (milliseconds since UNIX epoch).
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// Merge strategy for a data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Set union of array elements
    SetUnion,
    /// Per-key timestamp priority for mapping-shaped values
    KeyedTimestamp,
    /// Records keyed by their own `id`
    IdentifiedArray,
    /// Newer snapshot replaces the older one entirely
    LastWriterWins,
}

/// A value together with the time it was last written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped {
    /// The snapshot
    pub value: Value,
    /// Write time in milliseconds since UNIX epoch
    pub updated_at: i64,
}

impl Stamped {
    /// Pair a value with its write time.
    #[must_use]
    pub fn new(value: Value, updated_at: i64) -> Self {
        Self { value, updated_at }
    }
}

impl MergeStrategy {
    /// Merge `remote` into `local`.
    ///
    /// Shapes that do not fit the strategy fall back to last-writer-wins.
    #[must_use]
    pub fn merge(self, local: &Stamped, remote: &Stamped) -> Stamped {
        let updated_at = local.updated_at.max(remote.updated_at);
        let value = match (self, &local.value, &remote.value) {
            (MergeStrategy::SetUnion, Value::Array(l), Value::Array(r)) => set_union(l, r),
            (MergeStrategy::KeyedTimestamp, Value::Object(l), Value::Object(r)) => {
                keyed_timestamp(l, local.updated_at, r, remote.updated_at)
            }
            (MergeStrategy::IdentifiedArray, Value::Array(l), Value::Array(r)) => {
                identified_array(l, r)
            }
            _ => return last_writer_wins(local, remote),
        };
        Stamped { value, updated_at }
    }
}

fn set_union(local: &[Value], remote: &[Value]) -> Value {
    let mut merged = local.to_vec();
    for item in remote {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged.sort_by_cached_key(Value::to_string);
    Value::Array(merged)
}

/// Whether `remote` replaces `local` given their timestamps. Equal
/// timestamps fall back to a value ordering so both sides pick the same one.
fn remote_wins(local: &Value, local_ts: i64, remote: &Value, remote_ts: i64) -> bool {
    remote_ts > local_ts || (remote_ts == local_ts && remote.to_string() > local.to_string())
}

fn entry_timestamp(entry: &Value, fallback: i64) -> i64 {
    entry
        .get(UPDATED_AT_FIELD)
        .and_then(Value::as_i64)
        .unwrap_or(fallback)
}

fn keyed_timestamp(
    local: &Map<String, Value>,
    local_ts: i64,
    remote: &Map<String, Value>,
    remote_ts: i64,
) -> Value {
    let mut merged = local.clone();
    for (key, remote_entry) in remote {
        match merged.get(key) {
            None => {
                merged.insert(key.clone(), remote_entry.clone());
            }
            Some(local_entry) => {
                let l = entry_timestamp(local_entry, local_ts);
                let r = entry_timestamp(remote_entry, remote_ts);
                if remote_wins(local_entry, l, remote_entry, r) {
                    merged.insert(key.clone(), remote_entry.clone());
                }
            }
        }
    }
    Value::Object(merged)
}

fn identified_array(local: &[Value], remote: &[Value]) -> Value {
    let mut merged = local.to_vec();
    for remote_item in remote {
        let Some(id) = remote_item.get("id") else {
            if !merged.contains(remote_item) {
                merged.push(remote_item.clone());
            }
            continue;
        };
        match merged.iter().position(|item| item.get("id") == Some(id)) {
            Some(index) => {
                if entry_timestamp(remote_item, i64::MIN) > entry_timestamp(&merged[index], i64::MIN)
                {
                    merged[index] = remote_item.clone();
                }
            }
            None => merged.push(remote_item.clone()),
        }
    }
    // Records sort by id, id-less entries after them.
    merged.sort_by_cached_key(|item| match item.get("id") {
        Some(id) => (0, id.to_string()),
        None => (1, item.to_string()),
    });
    Value::Array(merged)
}

fn last_writer_wins(local: &Stamped, remote: &Stamped) -> Stamped {
    if remote_wins(&local.value, local.updated_at, &remote.value, remote.updated_at) {
        remote.clone()
    } else {
        local.clone()
    }
}

/// Maps data types to their merge strategy.
#[derive(Debug, Clone)]
pub struct MergeRegistry {
    strategies: HashMap<String, MergeStrategy>,
    fallback: MergeStrategy,
}

impl Default for MergeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeRegistry {
    /// Create a registry that merges everything last-writer-wins.
    #[must_use]
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
            fallback: MergeStrategy::LastWriterWins,
        }
    }

    /// Register the strategy for `data_type`.
    pub fn register(&mut self, data_type: impl Into<String>, strategy: MergeStrategy) {
        self.strategies.insert(data_type.into(), strategy);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, data_type: impl Into<String>, strategy: MergeStrategy) -> Self {
        self.register(data_type, strategy);
        self
    }

    /// Strategy used for `data_type`.
    #[must_use]
    pub fn strategy_for(&self, data_type: &str) -> MergeStrategy {
        self.strategies
            .get(data_type)
            .copied()
            .unwrap_or(self.fallback)
    }

    /// Data types with a registered strategy.
    pub fn data_types(&self) -> impl Iterator<Item = &str> {
        self.strategies.keys().map(String::as_str)
    }

    /// Merge two snapshots of `data_type`.
    #[must_use]
    pub fn merge(&self, data_type: &str, local: &Stamped, remote: &Stamped) -> Stamped {
        self.strategy_for(data_type).merge(local, remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_union_keeps_both_sides() {
        let local = Stamped::new(json!(["a", "b"]), 10);
        let remote = Stamped::new(json!(["b", "c"]), 5);

        let merged = MergeStrategy::SetUnion.merge(&local, &remote);

        assert_eq!(merged.value, json!(["a", "b", "c"]));
        assert_eq!(merged.updated_at, 10);
    }

    #[test]
    fn keyed_timestamp_per_key() {
        let local = Stamped::new(
            json!({
                "mon": {"slot": "9am", "updated_at": 100},
                "tue": {"slot": "1pm", "updated_at": 300}
            }),
            300,
        );
        let remote = Stamped::new(
            json!({
                "mon": {"slot": "10am", "updated_at": 200},
                "tue": {"slot": "2pm", "updated_at": 250},
                "wed": {"slot": "3pm", "updated_at": 50}
            }),
            250,
        );

        let merged = MergeStrategy::KeyedTimestamp.merge(&local, &remote);

        assert_eq!(merged.value["mon"]["slot"], json!("10am"));
        assert_eq!(merged.value["tue"]["slot"], json!("1pm"));
        assert_eq!(merged.value["wed"]["slot"], json!("3pm"));
    }

    #[test]
    fn keyed_timestamp_converges_on_ties() {
        let a = Stamped::new(json!({"k": {"v": 1, "updated_at": 7}}), 7);
        let b = Stamped::new(json!({"k": {"v": 2, "updated_at": 7}}), 7);

        let ab = MergeStrategy::KeyedTimestamp.merge(&a, &b);
        let ba = MergeStrategy::KeyedTimestamp.merge(&b, &a);
        assert_eq!(ab.value, ba.value);
    }

    #[test]
    fn identified_array_replaces_only_strictly_newer() {
        let local = Stamped::new(
            json!([
                {"id": 1, "qty": 5, "updated_at": 100},
                {"id": 2, "qty": 1, "updated_at": 100}
            ]),
            100,
        );
        let remote = Stamped::new(
            json!([
                {"id": 1, "qty": 7, "updated_at": 100},
                {"id": 2, "qty": 3, "updated_at": 101},
                {"id": 3, "qty": 9, "updated_at": 1}
            ]),
            101,
        );

        let merged = MergeStrategy::IdentifiedArray.merge(&local, &remote);

        assert_eq!(
            merged.value,
            json!([
                {"id": 1, "qty": 5, "updated_at": 100},
                {"id": 2, "qty": 3, "updated_at": 101},
                {"id": 3, "qty": 9, "updated_at": 1}
            ])
        );
    }

    #[test]
    fn registry_falls_back_to_lww() {
        let registry = MergeRegistry::new().with("completed", MergeStrategy::SetUnion);
        assert_eq!(registry.strategy_for("completed"), MergeStrategy::SetUnion);
        assert_eq!(
            registry.strategy_for("settings"),
            MergeStrategy::LastWriterWins
        );

        let older = Stamped::new(json!({"theme": "dark"}), 1);
        let newer = Stamped::new(json!({"theme": "light"}), 2);
        assert_eq!(registry.merge("settings", &older, &newer), newer);
        assert_eq!(registry.merge("settings", &newer, &older), newer);
    }

    #[test]
    fn lww_converges_on_equal_timestamps() {
        let a = Stamped::new(json!({"theme": "dark"}), 5);
        let b = Stamped::new(json!({"theme": "light"}), 5);

        let ab = MergeStrategy::LastWriterWins.merge(&a, &b);
        let ba = MergeStrategy::LastWriterWins.merge(&b, &a);
        assert_eq!(ab, ba);
        assert_eq!(ab, b);
    }

    #[test]
    fn set_union_is_order_independent() {
        let a = Stamped::new(json!(["t1", "t3"]), 1);
        let b = Stamped::new(json!(["t2"]), 2);

        let ab = MergeStrategy::SetUnion.merge(&a, &b);
        let ba = MergeStrategy::SetUnion.merge(&b, &a);
        assert_eq!(ab.value, ba.value);
        assert_eq!(ab.value, json!(["t1", "t2", "t3"]));
    }

    #[test]
    fn mismatched_shape_uses_lww() {
        let local = Stamped::new(json!(["a"]), 1);
        let remote = Stamped::new(json!({"not": "an array"}), 2);
        assert_eq!(MergeStrategy::SetUnion.merge(&local, &remote), remote);
    }
}
