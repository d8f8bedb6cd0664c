//! # opsync Core
//!
//! Causality, operations and conflict resolution for offline-first,
//! multi-device synchronization.
//!
//! This crate provides:
//! - Vector clocks distinguishing causal successors from true conflicts
//! - Immutable operations carrying a clock snapshot
//! - An operation manager that applies, resolves and rolls back operations
//! - Whole-value merge strategies for broadcast synchronization

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod manager;
pub mod merge;
pub mod operation;
pub mod state;

pub use clock::{Causality, ClockSnapshot, DeviceId, LogicalClock};
pub use manager::{
    Applied, DevicePrecedence, IgnoreReason, LatestWallClock, OperationManager, Outcome,
    SyncError, TieBreak,
};
pub use merge::{MergeRegistry, MergeStrategy, Stamped};
pub use operation::{Collection, EntityKey, Operation, OperationKind, Priority, Record};
pub use state::Dataset;
