//! Per-device operation manager.
//!
//! Creates operations stamped with the device's vector clock, applies them
//! to a [`Dataset`], collapses competing operations on the same entity and
//! rolls optimistic edits back.
//!
//! # Dispatch
//!
//! | Collection | create | update | complete | delete |
//! |------------|--------|--------|----------|--------|
//! | tasks      | insert | replace | flag    | remove |
//! | schedules  | insert | replace | ignored | remove |
//! | inventory  | insert | replace | ignored | remove |
//!
//! Custom kinds and unknown collections are ignored with a typed reason so
//! older devices tolerate operations produced by newer ones.

use crate::clock::{Causality, DeviceId, LogicalClock};
use crate::operation::{Collection, EntityKey, Operation, OperationKind, Record};
use crate::state::Dataset;
use chrono::Utc;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Why an operation was deliberately not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The target collection is not known to this build
    UnknownCollection(String),
    /// The operation kind is not known to this build
    UnknownKind(String),
    /// The collection does not support this kind
    Unsupported {
        /// Target collection
        collection: Collection,
        /// Rejected kind
        kind: OperationKind,
    },
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IgnoreReason::UnknownCollection(name) => write!(f, "unknown collection '{name}'"),
            IgnoreReason::UnknownKind(name) => write!(f, "unknown operation kind '{name}'"),
            IgnoreReason::Unsupported { collection, kind } => {
                write!(f, "'{kind}' is not supported on '{collection}'")
            }
        }
    }
}

/// Effect an operation had on the dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The dataset changed
    Changed,
    /// The operation was understood but changed nothing (e.g. missing id)
    Unchanged,
    /// The operation was deliberately skipped
    Ignored(IgnoreReason),
}

/// Result of applying one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// The dataset after the operation
    pub state: Dataset,
    /// What happened
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutation {
    Insert,
    Replace,
    MarkComplete,
    Remove,
}

fn mutation_for(target: &Collection, kind: &OperationKind) -> Result<Mutation, IgnoreReason> {
    match (target, kind) {
        (Collection::Other(name), _) => Err(IgnoreReason::UnknownCollection(name.clone())),
        (_, OperationKind::Custom(name)) => Err(IgnoreReason::UnknownKind(name.clone())),
        (_, OperationKind::Create) => Ok(Mutation::Insert),
        (_, OperationKind::Update) => Ok(Mutation::Replace),
        (_, OperationKind::Delete) => Ok(Mutation::Remove),
        (Collection::Tasks, OperationKind::Complete) => Ok(Mutation::MarkComplete),
        (Collection::Schedules | Collection::Inventory, OperationKind::Complete) => {
            Err(IgnoreReason::Unsupported {
                collection: target.clone(),
                kind: kind.clone(),
            })
        }
    }
}

/// Decides between two causally concurrent operations on the same entity.
pub trait TieBreak: Send + Sync {
    /// Return `true` if `candidate` should replace `current`.
    ///
    /// Implementations must be a strict total order over distinct
    /// operations so that every device picks the same winner.
    fn prefer(&self, candidate: &Operation, current: &Operation) -> bool;
}

/// Later wall-clock creation time wins; device id then operation id break
/// exact ties.
///
/// Assumes device clocks are roughly synchronized.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestWallClock;

impl TieBreak for LatestWallClock {
    fn prefer(&self, candidate: &Operation, current: &Operation) -> bool {
        (candidate.created_at(), candidate.origin_device(), candidate.id())
            > (current.created_at(), current.origin_device(), current.id())
    }
}

/// Greater device id wins regardless of wall-clock time.
///
/// Immune to clock skew at the cost of favouring one device consistently.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevicePrecedence;

impl TieBreak for DevicePrecedence {
    fn prefer(&self, candidate: &Operation, current: &Operation) -> bool {
        (candidate.origin_device(), candidate.origin_version(), candidate.id())
            > (current.origin_device(), current.origin_version(), current.id())
    }
}

/// Creates, applies, resolves and rolls back operations for one device.
pub struct OperationManager {
    clock: LogicalClock,
    tie_break: Box<dyn TieBreak>,
}

impl std::fmt::Debug for OperationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationManager")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl OperationManager {
    /// Create a manager for `device` with the default tie-break.
    #[must_use]
    pub fn new(device: DeviceId) -> Self {
        Self::with_clock(LogicalClock::new(device))
    }

    /// Create a manager around an existing clock.
    #[must_use]
    pub fn with_clock(clock: LogicalClock) -> Self {
        Self {
            clock,
            tie_break: Box::new(LatestWallClock),
        }
    }

    /// Replace the concurrent-conflict tie-break strategy.
    #[must_use]
    pub fn with_tie_break(mut self, tie_break: impl TieBreak + 'static) -> Self {
        self.tie_break = Box::new(tie_break);
        self
    }

    /// The device this manager acts for.
    #[must_use]
    pub fn device(&self) -> &DeviceId {
        self.clock.owner()
    }

    /// The manager's clock.
    #[must_use]
    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    /// Stamp a new local operation.
    pub fn create_operation(
        &mut self,
        kind: OperationKind,
        payload: Record,
        target: Collection,
    ) -> Operation {
        let clock = self.clock.increment();
        let origin_version = self.clock.local_counter();
        let op = Operation::from_parts(
            Uuid::new_v4(),
            kind,
            payload,
            Utc::now(),
            self.clock.owner().clone(),
            clock,
            target,
            origin_version,
        );
        tracing::debug!(
            op_id = %op.id(),
            kind = %op.kind(),
            entity = %op.entity_key(),
            clock = %op.clock(),
            "Created operation"
        );
        op
    }

    /// Stamp a new local operation after checking it against `state`.
    ///
    /// `update`, `complete` and `delete` must name a record present in
    /// `state`; `create` must not. A `complete` or `delete` carries the
    /// stored record as its payload so it can be rolled back.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingEntity`] if the record does not exist and
    /// [`SyncError::DuplicateEntity`] if a created record already exists; the
    /// clock is not advanced in either case.
    pub fn checked_operation(
        &mut self,
        kind: OperationKind,
        payload: Record,
        target: Collection,
        state: &Dataset,
    ) -> Result<Operation, SyncError> {
        let existing = state.find(&target, &payload.id);
        let payload = match (&kind, existing) {
            (OperationKind::Create, Some(_)) => {
                return Err(SyncError::DuplicateEntity(EntityKey {
                    collection: target,
                    id: payload.id,
                }));
            }
            (OperationKind::Update | OperationKind::Complete | OperationKind::Delete, None) => {
                return Err(SyncError::MissingEntity(EntityKey {
                    collection: target,
                    id: payload.id,
                }));
            }
            (OperationKind::Complete | OperationKind::Delete, Some(stored)) => stored.clone(),
            _ => payload,
        };
        Ok(self.create_operation(kind, payload, target))
    }

    /// Absorb the clock of an operation received from another device.
    pub fn observe(&mut self, op: &Operation) {
        self.clock.merge(op.clock());
    }

    /// Apply an operation to a copy of `state`.
    ///
    /// Never fails: unknown operations are reported as
    /// [`Outcome::Ignored`].
    #[must_use]
    pub fn apply_operation(&self, op: &Operation, state: &Dataset) -> Applied {
        apply_operation(op, state)
    }

    /// Apply operations in order, returning the final dataset.
    #[must_use]
    pub fn apply_all<'a>(
        &self,
        ops: impl IntoIterator<Item = &'a Operation>,
        state: &Dataset,
    ) -> Dataset {
        ops.into_iter()
            .fold(state.clone(), |acc, op| apply_operation(op, &acc).state)
    }

    /// Collapse competing operations to one winner per entity.
    #[must_use]
    pub fn resolve_conflicts(&self, ops: Vec<Operation>) -> Vec<Operation> {
        resolve_conflicts(ops, self.tie_break.as_ref())
    }

    /// Best-effort inverse of [`apply_operation`](Self::apply_operation).
    ///
    /// Operations are undone newest first. Only correct when nothing else
    /// has touched the same entities since.
    #[must_use]
    pub fn rollback_operations(&self, ops: &[Operation], state: &Dataset) -> Dataset {
        rollback_operations(ops, state)
    }
}

/// Apply one operation to a copy of `state`.
#[must_use]
pub fn apply_operation(op: &Operation, state: &Dataset) -> Applied {
    let mutation = match mutation_for(op.target(), op.kind()) {
        Ok(mutation) => mutation,
        Err(reason) => {
            tracing::debug!(op_id = %op.id(), %reason, "Ignoring operation");
            return Applied {
                state: state.clone(),
                outcome: Outcome::Ignored(reason),
            };
        }
    };

    let mut next = state.clone();
    let target = op.target();
    let id = op.payload().id.as_str();

    let changed = match mutation {
        Mutation::Insert => {
            let unchanged = next.find(target, id) == Some(op.payload());
            next.append(target, op.payload().clone());
            !unchanged
        }
        Mutation::Replace => match next.find_mut(target, id) {
            Some(record) if record != op.payload() => {
                *record = op.payload().clone();
                true
            }
            _ => false,
        },
        Mutation::MarkComplete => match next.find_mut(target, id) {
            Some(record) if !record.completed => {
                record.completed = true;
                true
            }
            _ => false,
        },
        Mutation::Remove => next.remove(target, id).is_some(),
    };

    Applied {
        state: next,
        outcome: if changed {
            Outcome::Changed
        } else {
            Outcome::Unchanged
        },
    }
}

/// Undo operations newest first on a copy of `state`.
#[must_use]
pub fn rollback_operations(ops: &[Operation], state: &Dataset) -> Dataset {
    let mut next = state.clone();
    for op in ops.iter().rev() {
        let target = op.target();
        let id = op.payload().id.as_str();
        match mutation_for(target, op.kind()) {
            Ok(Mutation::Insert) => {
                next.remove(target, id);
            }
            Ok(Mutation::MarkComplete) => {
                // The payload holds the flag as it was before the operation.
                if let Some(record) = next.find_mut(target, id) {
                    record.completed = op.payload().completed;
                }
            }
            Ok(Mutation::Remove) => {
                if !next.contains(target, id) {
                    next.append(target, op.payload().clone());
                }
            }
            Ok(Mutation::Replace) => {
                tracing::debug!(op_id = %op.id(), "Update has no inverse, skipping rollback");
            }
            Err(_) => {}
        }
    }
    next
}

/// Collapse competing operations to one winner per entity key.
///
/// Within a group a causally later operation always wins; concurrent
/// operations are decided by `tie_break`. Groups are folded in a canonical
/// order, so the result does not depend on the order of `ops`.
#[must_use]
pub fn resolve_conflicts(ops: Vec<Operation>, tie_break: &dyn TieBreak) -> Vec<Operation> {
    let mut groups: BTreeMap<EntityKey, Vec<Operation>> = BTreeMap::new();
    for op in ops {
        groups.entry(op.entity_key()).or_default().push(op);
    }

    groups
        .into_iter()
        .filter_map(|(key, mut group)| {
            group.sort_by(|a, b| {
                (a.created_at(), a.origin_device(), a.id())
                    .cmp(&(b.created_at(), b.origin_device(), b.id()))
            });
            let candidates = group.len();
            let winner = group.into_iter().reduce(|winner, candidate| {
                match candidate.clock().compare(winner.clock()) {
                    Causality::After => candidate,
                    Causality::Before => winner,
                    Causality::Concurrent => {
                        if tie_break.prefer(&candidate, &winner) {
                            candidate
                        } else {
                            winner
                        }
                    }
                }
            })?;
            if candidates > 1 {
                tracing::debug!(
                    entity = %key,
                    candidates,
                    winner = %winner.id(),
                    "Resolved conflict"
                );
            }
            Some(winner)
        })
        .collect()
}

/// Errors raised synchronously while constructing operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The referenced entity does not exist
    #[error("entity {0} does not exist")]
    MissingEntity(EntityKey),

    /// A created entity already exists
    #[error("entity {0} already exists")]
    DuplicateEntity(EntityKey),
}
