//! Vector clock used as the causality primitive between devices.
//!
//! Each device owns exactly one counter. A device advances only its own
//! counter and absorbs knowledge of other devices by merging the clocks it
//! receives. Comparing two clocks yields the standard vector-clock partial
//! order, which is the only thing that separates a genuine conflict from a
//! causal successor.

use crdts::{CmRDT, Dot, VClock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Identifier of a participating device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Causal relation of one clock relative to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Causality {
    /// The local clock is dominated by the other one.
    Before,
    /// The local clock dominates the other one.
    After,
    /// Neither clock dominates (identical clocks included).
    Concurrent,
}

impl Causality {
    /// The same relation seen from the other clock.
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            Causality::Before => Causality::After,
            Causality::After => Causality::Before,
            Causality::Concurrent => Causality::Concurrent,
        }
    }
}

/// An immutable copy of a vector clock.
///
/// Operations embed one of these so later clock advances cannot rewrite the
/// provenance of an operation that already exists.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<DeviceId, u64>",
    into = "BTreeMap<DeviceId, u64>"
)]
pub struct ClockSnapshot(VClock<DeviceId>);

impl ClockSnapshot {
    /// Build a snapshot from explicit `(device, counter)` entries.
    #[must_use]
    pub fn from_entries<I, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (D, u64)>,
        D: Into<DeviceId>,
    {
        let mut clock = VClock::new();
        for (device, counter) in entries {
            clock.apply(Dot::new(device.into(), counter));
        }
        Self(clock)
    }

    /// Counter recorded for `device` (zero when absent).
    #[must_use]
    pub fn get(&self, device: &DeviceId) -> u64 {
        self.0.get(device)
    }

    /// Iterate over `(device, counter)` entries in device order.
    pub fn entries(&self) -> impl Iterator<Item = (&DeviceId, u64)> {
        self.0.dots.iter().map(|(device, counter)| (device, *counter))
    }

    /// Compare against another clock using the vector-clock partial order.
    #[must_use]
    pub fn compare(&self, other: &ClockSnapshot) -> Causality {
        match self.0.partial_cmp(&other.0) {
            Some(Ordering::Less) => Causality::Before,
            Some(Ordering::Greater) => Causality::After,
            Some(Ordering::Equal) | None => Causality::Concurrent,
        }
    }

    /// Whether no device has recorded an event yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<DeviceId, u64>> for ClockSnapshot {
    fn from(entries: BTreeMap<DeviceId, u64>) -> Self {
        Self::from_entries(entries)
    }
}

impl From<ClockSnapshot> for BTreeMap<DeviceId, u64> {
    fn from(snapshot: ClockSnapshot) -> Self {
        snapshot.0.dots
    }
}

impl std::fmt::Display for ClockSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (device, counter)) in self.entries().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{device}:{counter}")?;
        }
        f.write_str("}")
    }
}

/// The vector clock owned by one device.
#[derive(Debug, Clone)]
pub struct LogicalClock {
    owner: DeviceId,
    clock: VClock<DeviceId>,
}

impl LogicalClock {
    /// Create an empty clock owned by `owner`.
    #[must_use]
    pub fn new(owner: DeviceId) -> Self {
        Self {
            owner,
            clock: VClock::new(),
        }
    }

    /// Restore a clock for `owner` from a previously taken snapshot.
    #[must_use]
    pub fn restore(owner: DeviceId, snapshot: ClockSnapshot) -> Self {
        Self {
            owner,
            clock: snapshot.0,
        }
    }

    /// The owning device.
    #[must_use]
    pub fn owner(&self) -> &DeviceId {
        &self.owner
    }

    /// Advance the owner's counter and return the resulting snapshot.
    pub fn increment(&mut self) -> ClockSnapshot {
        let dot = self.clock.inc(self.owner.clone());
        self.clock.apply(dot);
        self.get_clock()
    }

    /// The owner's current counter.
    #[must_use]
    pub fn local_counter(&self) -> u64 {
        self.clock.get(&self.owner)
    }

    /// An immutable copy of the current clock.
    #[must_use]
    pub fn get_clock(&self) -> ClockSnapshot {
        ClockSnapshot(self.clock.clone())
    }

    /// Absorb a remote clock by element-wise maximum.
    ///
    /// The owner's own entry is left untouched: only this device may advance
    /// its counter.
    pub fn merge(&mut self, remote: &ClockSnapshot) {
        for (device, counter) in remote.entries() {
            if *device == self.owner {
                continue;
            }
            self.clock.apply(Dot::new(device.clone(), counter));
        }
    }

    /// Compare the current clock against `other`.
    #[must_use]
    pub fn compare(&self, other: &ClockSnapshot) -> Causality {
        self.get_clock().compare(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(entries: &[(&str, u64)]) -> ClockSnapshot {
        ClockSnapshot::from_entries(entries.iter().map(|(d, c)| (*d, *c)))
    }

    #[test]
    fn increment_advances_only_owner() {
        let mut clock = LogicalClock::new(DeviceId::new("a"));
        clock.merge(&snapshot(&[("b", 4)]));

        let after = clock.increment();

        assert_eq!(after.get(&DeviceId::new("a")), 1);
        assert_eq!(after.get(&DeviceId::new("b")), 4);
        assert_eq!(clock.local_counter(), 1);
    }

    #[test]
    fn snapshot_is_detached_from_clock() {
        let mut clock = LogicalClock::new(DeviceId::new("a"));
        let first = clock.increment();
        clock.increment();

        assert_eq!(first.get(&DeviceId::new("a")), 1);
        assert_eq!(clock.get_clock().get(&DeviceId::new("a")), 2);
    }

    #[test]
    fn merge_takes_elementwise_max_but_keeps_own_counter() {
        let mut clock = LogicalClock::new(DeviceId::new("a"));
        clock.increment();
        clock.merge(&snapshot(&[("a", 9), ("b", 3), ("c", 1)]));
        clock.merge(&snapshot(&[("b", 2), ("c", 5)]));

        let now = clock.get_clock();
        assert_eq!(now.get(&DeviceId::new("a")), 1);
        assert_eq!(now.get(&DeviceId::new("b")), 3);
        assert_eq!(now.get(&DeviceId::new("c")), 5);
    }

    #[test]
    fn compare_partial_order() {
        let a = snapshot(&[("a", 1)]);
        let ab = snapshot(&[("a", 1), ("b", 1)]);
        let b = snapshot(&[("b", 1)]);

        assert_eq!(a.compare(&ab), Causality::Before);
        assert_eq!(ab.compare(&a), Causality::After);
        assert_eq!(a.compare(&b), Causality::Concurrent);
        assert_eq!(a.compare(&a.clone()), Causality::Concurrent);
    }

    #[test]
    fn snapshot_serializes_as_flat_map() {
        let clock = snapshot(&[("a", 2), ("b", 1)]);
        let json = serde_json::to_value(&clock).unwrap();
        assert_eq!(json, serde_json::json!({"a": 2, "b": 1}));

        let back: ClockSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, clock);
        assert_eq!(clock.to_string(), "{a:2, b:1}");
    }

    fn arb_clock() -> impl Strategy<Value = ClockSnapshot> {
        prop::collection::btree_map("[a-d]", 0u64..4, 0..4).prop_map(|entries| {
            ClockSnapshot::from_entries(entries.into_iter().map(|(d, c)| (DeviceId::new(d), c)))
        })
    }

    proptest! {
        #[test]
        fn compare_is_antisymmetric(a in arb_clock(), b in arb_clock()) {
            let ab = a.compare(&b);
            let ba = b.compare(&a);
            prop_assert_eq!(ab, ba.reverse());
            prop_assert_eq!(ab == Causality::Before, ba == Causality::After);
        }

        #[test]
        fn merged_clock_never_before_inputs(a in arb_clock(), b in arb_clock()) {
            let mut clock = LogicalClock::restore(DeviceId::new("z"), a.clone());
            clock.merge(&b);
            let merged = clock.get_clock();
            prop_assert_ne!(merged.compare(&a), Causality::Before);
            prop_assert_ne!(merged.compare(&b), Causality::Before);
        }
    }
}
