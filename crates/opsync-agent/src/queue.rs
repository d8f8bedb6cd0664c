//! Durable, prioritized offline queue.
//!
//! Every local operation is written through to an [`OperationStore`] before
//! delivery is attempted, so pending work survives restarts. The queue is
//! drained by [`OfflineQueue::process_queue`], which sends by priority class:
//!
//! | Class | Kinds | Dispatch |
//! |-------|-------|----------|
//! | Critical | `complete`, `delete` | one at a time, each awaited |
//! | Normal | `create`, `update` | concurrently as one batch |
//! | Background | custom kinds | staggered, `index × stagger` |
//!
//! An entry leaves the queue only when its send succeeds or it outlives the
//! TTL.

use crate::persistence::{OperationStore, StoreError};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use opsync_core::{EntityKey, Operation, Priority};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Age after which undelivered entries are dropped
    pub ttl: Duration,
    /// Per-item delay step for background sends
    pub background_stagger: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            background_stagger: Duration::from_millis(100),
        }
    }
}

/// An operation waiting for acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The pending operation
    pub operation: Operation,
    /// When the entry was queued
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Pair an operation with its enqueue time.
    #[must_use]
    pub fn new(operation: Operation, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            operation,
            enqueued_at,
        }
    }

    /// Delivery class of the queued operation.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.operation.priority()
    }
}

/// Whether an enqueued entry reached durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Written to the store
    Persisted,
    /// The store write failed; the entry lives only for this session
    MemoryOnly,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries acknowledged and removed
    pub sent: usize,
    /// Entries whose send failed and stay queued
    pub failed: usize,
    /// Entries left in the queue afterwards
    pub remaining: usize,
}

/// Prioritized queue of operations awaiting acknowledgement.
#[derive(Debug)]
pub struct OfflineQueue<S> {
    store: S,
    entries: Vec<QueueEntry>,
    config: QueueConfig,
}

impl<S: OperationStore> OfflineQueue<S> {
    /// Open the queue and hydrate it from `store`.
    ///
    /// # Errors
    ///
    /// Returns error if the stored entries cannot be read.
    pub fn open(store: S, config: QueueConfig) -> Result<Self, QueueError> {
        let entries = store.load_all()?;
        tracing::info!(pending = entries.len(), "Offline queue hydrated");
        Ok(Self {
            store,
            entries,
            config,
        })
    }

    /// Queue tuning in effect.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending entries in enqueue order.
    #[must_use]
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// Queue an operation now.
    pub fn enqueue(&mut self, op: Operation) -> Durability {
        self.enqueue_at(op, Utc::now())
    }

    /// Queue an operation with an explicit enqueue time.
    ///
    /// Re-enqueueing an operation id replaces the earlier entry.
    pub fn enqueue_at(&mut self, op: Operation, enqueued_at: DateTime<Utc>) -> Durability {
        let entry = QueueEntry::new(op, enqueued_at);
        let durability = match self.store.put(&entry) {
            Ok(()) => Durability::Persisted,
            Err(err) => {
                tracing::warn!(
                    op_id = %entry.operation.id(),
                    error = %err,
                    "Failed to persist queued operation; keeping it in memory"
                );
                Durability::MemoryOnly
            }
        };

        tracing::debug!(
            op_id = %entry.operation.id(),
            kind = %entry.operation.kind(),
            priority = ?entry.priority(),
            "Enqueued operation"
        );

        let id = entry.operation.id();
        self.entries.retain(|e| e.operation.id() != id);
        self.entries.push(entry);
        durability
    }

    /// Keep only the most recently enqueued entry per entity.
    ///
    /// Valid only because every payload is a full replacement of the
    /// entity: a later entry carries everything an earlier one did. Returns
    /// the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns error if the store rewrite fails; memory is left untouched in
    /// that case.
    pub fn compact_operation_log(&mut self) -> Result<usize, QueueError> {
        let mut latest: HashMap<EntityKey, usize> = HashMap::new();
        for (index, entry) in self.entries.iter().enumerate() {
            let key = entry.operation.entity_key();
            match latest.get(&key) {
                Some(&current) if self.entries[current].enqueued_at > entry.enqueued_at => {}
                _ => {
                    latest.insert(key, index);
                }
            }
        }

        if latest.len() == self.entries.len() {
            return Ok(0);
        }

        let keep: HashSet<usize> = latest.into_values().collect();
        let compacted: Vec<QueueEntry> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(index, _)| keep.contains(index))
            .map(|(_, entry)| entry.clone())
            .collect();

        self.store.replace_all(&compacted)?;
        let removed = self.entries.len() - compacted.len();
        self.entries = compacted;

        tracing::info!(removed, remaining = self.entries.len(), "Compacted offline queue");
        Ok(removed)
    }

    /// Drop entries queued longer than `ttl` ago without sending them.
    ///
    /// Returns the number of entries removed. Store failures are logged;
    /// the entries are dropped from memory regardless.
    pub fn clean_expired_operations(&mut self, ttl: Duration) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else {
            return 0;
        };

        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.enqueued_at < cutoff);
        self.entries = live;

        for entry in &expired {
            tracing::warn!(
                op_id = %entry.operation.id(),
                enqueued_at = %entry.enqueued_at,
                "Dropping expired operation"
            );
            if let Err(err) = self.store.delete(entry.operation.id()) {
                tracing::warn!(op_id = %entry.operation.id(), error = %err, "Failed to delete expired operation");
            }
        }

        expired.len()
    }

    /// Pending entries in delivery order: critical, normal, background,
    /// FIFO within a class.
    #[must_use]
    pub fn prioritize_operations(&self) -> Vec<&QueueEntry> {
        let mut ordered: Vec<&QueueEntry> = self.entries.iter().collect();
        ordered.sort_by_key(|entry| entry.priority());
        ordered
    }

    /// Attempt delivery of every pending entry through `send`.
    ///
    /// Successful sends are removed from memory and the store. A failed send
    /// leaves its entry queued and does not stop the others; there is no
    /// retry within one call.
    pub async fn process_queue<F, Fut, E>(&mut self, send: F) -> DrainReport
    where
        F: Fn(Operation) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let mut critical = Vec::new();
        let mut normal = Vec::new();
        let mut background = Vec::new();
        for entry in self.prioritize_operations() {
            let op = entry.operation.clone();
            match entry.priority() {
                Priority::Critical => critical.push(op),
                Priority::Normal => normal.push(op),
                Priority::Background => background.push(op),
            }
        }

        if critical.is_empty() && normal.is_empty() && background.is_empty() {
            return DrainReport::default();
        }

        let send = &send;
        let mut results: Vec<(Uuid, Result<(), E>)> = Vec::new();

        for op in critical {
            let id = op.id();
            results.push((id, send(op).await));
        }

        results.extend(
            join_all(normal.into_iter().map(|op| async move {
                let id = op.id();
                (id, send(op).await)
            }))
            .await,
        );

        let stagger = self.config.background_stagger;
        results.extend(
            join_all(background.into_iter().enumerate().map(|(index, op)| async move {
                let delay = stagger.saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let id = op.id();
                (id, send(op).await)
            }))
            .await,
        );

        let mut report = DrainReport::default();
        let mut delivered = HashSet::new();
        for (id, result) in results {
            match result {
                Ok(()) => {
                    report.sent += 1;
                    delivered.insert(id);
                    if let Err(err) = self.store.delete(id) {
                        tracing::warn!(op_id = %id, error = %err, "Failed to delete delivered operation");
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(op_id = %id, error = %err, "Delivery failed, operation stays queued");
                }
            }
        }

        self.entries.retain(|e| !delivered.contains(&e.operation.id()));
        report.remaining = self.entries.len();

        tracing::info!(
            sent = report.sent,
            failed = report.failed,
            remaining = report.remaining,
            "Processed offline queue"
        );
        report
    }
}

/// Errors for offline queue operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The backing store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
