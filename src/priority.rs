//! Egress scheduling interface.
//!
//! The transaction never decides which stream writes next; it only tells
//! an external scheduler whether it has work. The scheduler hands out
//! opaque handles and later drives
//! [`on_write_ready`](crate::Transaction::on_write_ready) on runnable
//! entries in whatever order its policy dictates.

use slab::Slab;

use crate::StreamId;

/// Stream priority: dependency, weight, exclusivity (RFC 7540 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    /// Stream this one depends on; 0 is the root.
    pub dependency: u64,
    /// Scheduling weight, 1..=256 encoded as the wire value plus one.
    pub weight: u16,
    pub exclusive: bool,
}

impl Default for Priority {
    fn default() -> Self {
        Priority {
            dependency: 0,
            weight: 16,
            exclusive: false,
        }
    }
}

/// Opaque reference into an [`EgressQueue`].
///
/// Wraps a slab key, in the style of other opaque index handles in this
/// stack. The queue does not own the transaction; the transaction
/// registers and deregisters itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub(crate) usize);

impl QueueHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Scheduling contract between a transaction and the session's scheduler.
///
/// Implementations decide ordering (priority tree, round-robin, strict
/// FIFO); the transaction only flips its own pending-egress bit.
pub trait EgressQueue {
    /// Register a transaction. Called once at transaction open.
    fn add(&mut self, id: StreamId, priority: Priority) -> QueueHandle;

    /// Deregister. Called at detach.
    fn remove(&mut self, handle: QueueHandle);

    /// Mark the entry as having bytes (or an EOM) to flush.
    fn set_pending_egress(&mut self, handle: QueueHandle);

    /// Clear the pending-egress mark.
    fn clear_pending_egress(&mut self, handle: QueueHandle);

    fn is_enqueued(&self, handle: QueueHandle) -> bool;

    /// Re-parent or re-weight the entry.
    fn update_priority(&mut self, handle: QueueHandle, priority: Priority);
}

/// A minimal scheduler: round-robin over pending entries, priorities
/// recorded but not used for ordering. Stands in for a real priority tree
/// in tests and single-stream sessions.
#[derive(Debug, Default)]
pub struct RoundRobinQueue {
    entries: Slab<Entry>,
}

#[derive(Debug)]
struct Entry {
    id: StreamId,
    priority: Priority,
    pending: bool,
}

impl RoundRobinQueue {
    pub fn new() -> Self {
        RoundRobinQueue::default()
    }

    /// Runnable transactions, in registration order.
    pub fn pending(&self) -> Vec<StreamId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.pending)
            .map(|(_, e)| e.id)
            .collect()
    }

    pub fn priority_of(&self, handle: QueueHandle) -> Option<Priority> {
        self.entries.get(handle.0).map(|e| e.priority)
    }
}

impl EgressQueue for RoundRobinQueue {
    fn add(&mut self, id: StreamId, priority: Priority) -> QueueHandle {
        QueueHandle(self.entries.insert(Entry {
            id,
            priority,
            pending: false,
        }))
    }

    fn remove(&mut self, handle: QueueHandle) {
        if self.entries.contains(handle.0) {
            self.entries.remove(handle.0);
        }
    }

    fn set_pending_egress(&mut self, handle: QueueHandle) {
        if let Some(e) = self.entries.get_mut(handle.0) {
            e.pending = true;
        }
    }

    fn clear_pending_egress(&mut self, handle: QueueHandle) {
        if let Some(e) = self.entries.get_mut(handle.0) {
            e.pending = false;
        }
    }

    fn is_enqueued(&self, handle: QueueHandle) -> bool {
        self.entries.get(handle.0).map(|e| e.pending).unwrap_or(false)
    }

    fn update_priority(&mut self, handle: QueueHandle, priority: Priority) {
        if let Some(e) = self.entries.get_mut(handle.0) {
            e.priority = priority;
        }
    }
}
