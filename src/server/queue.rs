//! Timed queue of live connections (HTTP/1.1 keep-alive).
//!
//! A binary min-heap keyed by last-activity time, paired with a
//! handle-to-slot table so a connection can be re-prioritized or removed
//! in O(log n) when it sees traffic or closes early. The heap root is
//! always the connection closest to its idle deadline, which is also what
//! the reactor derives its poll timeout from.

use std::{fmt, time::Instant};
use tracing::{debug, warn};

/// One queued connection: its arena handle and its last-activity time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub(crate) handle: usize,
    pub(crate) priority: Instant,
}

/// Returned by [`ConnectionQueue::enqueue`] when the queue is at capacity
/// (or the handle cannot be tracked). Caller policy: reject the connection.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct QueueFull;

pub(crate) struct ConnectionQueue {
    heap: Vec<QueueEntry>,
    slot_of: Box<[Option<usize>]>,
}

/// Heap-order dump of every live slot with its handle and priority age,
/// for trace logging around the sweep.
impl fmt::Debug for ConnectionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (slot, entry) in self.heap.iter().enumerate() {
            list.entry(&format_args!(
                "slot {} handle {} age {:?}",
                slot,
                entry.handle,
                entry.priority.elapsed()
            ));
        }
        list.finish()
    }
}

impl ConnectionQueue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            slot_of: vec![None; capacity].into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.slot_of.len()
    }

    /// Inserts a handle at the given priority.
    ///
    /// Handles outside `0..capacity` and handles already present are
    /// rejected without mutating the queue.
    pub(crate) fn enqueue(&mut self, handle: usize, priority: Instant) -> Result<(), QueueFull> {
        if self.heap.len() == self.capacity() {
            warn!(handle, "connection queue full");
            return Err(QueueFull);
        }
        match self.slot_of.get(handle) {
            Some(None) => {}
            _ => {
                warn!(handle, "refusing to enqueue untrackable handle");
                return Err(QueueFull);
            }
        }

        self.heap.push(QueueEntry { handle, priority });
        let slot = self.heap.len() - 1;
        self.slot_of[handle] = Some(slot);
        self.sift_up(slot);
        Ok(())
    }

    /// Re-keys a queued handle. Updating an absent handle is a no-op.
    pub(crate) fn update(&mut self, handle: usize, priority: Instant) {
        let Some(slot) = self.slot_of.get(handle).copied().flatten() else {
            warn!(handle, "update for handle not in queue, skipping");
            return;
        };

        let old = self.heap[slot].priority;
        self.heap[slot].priority = priority;
        if priority < old {
            self.sift_up(slot);
        } else {
            self.sift_down(slot);
        }
    }

    /// Removes and returns the entry with the smallest priority.
    pub(crate) fn dequeue_min(&mut self) -> Option<QueueEntry> {
        let last = self.heap.len().checked_sub(1)?;
        self.heap.swap(0, last);
        let entry = self.heap.pop()?;
        self.slot_of[entry.handle] = None;
        if !self.heap.is_empty() {
            self.slot_of[self.heap[0].handle] = Some(0);
            self.sift_down(0);
        }
        Some(entry)
    }

    /// Removes a handle from anywhere in the heap.
    pub(crate) fn remove(&mut self, handle: usize) -> Option<QueueEntry> {
        let Some(slot) = self.slot_of.get(handle).copied().flatten() else {
            debug!(handle, "remove for handle not in queue");
            return None;
        };

        let last = self.heap.len() - 1;
        self.heap.swap(slot, last);
        let entry = self.heap.pop()?;
        self.slot_of[entry.handle] = None;

        if slot < self.heap.len() {
            self.slot_of[self.heap[slot].handle] = Some(slot);
            // The displaced entry may need to move either way.
            if slot > 0 && self.heap[slot].priority < self.heap[parent(slot)].priority {
                self.sift_up(slot);
            } else {
                self.sift_down(slot);
            }
        }
        Some(entry)
    }

    /// The entry closest to expiry, without removing it.
    #[inline]
    pub(crate) fn peek_min(&self) -> Option<&QueueEntry> {
        self.heap.first()
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 && self.heap[slot].priority < self.heap[parent(slot)].priority {
            self.swap_slots(slot, parent(slot));
            slot = parent(slot);
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        loop {
            let mut smallest = slot;
            for child in [left(slot), right(slot)] {
                if child < self.heap.len()
                    && self.heap[child].priority < self.heap[smallest].priority
                {
                    smallest = child;
                }
            }
            if smallest == slot {
                return;
            }
            self.swap_slots(slot, smallest);
            slot = smallest;
        }
    }

    // Both slot table entries are fixed before returning; every public
    // operation leaves `slot_of[heap[i].handle] == i` for all live slots.
    fn swap_slots(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.slot_of[self.heap[a].handle] = Some(a);
        self.slot_of[self.heap[b].handle] = Some(b);
    }
}

#[inline(always)]
fn parent(slot: usize) -> usize {
    (slot - 1) / 2
}

#[inline(always)]
fn left(slot: usize) -> usize {
    2 * slot + 1
}

#[inline(always)]
fn right(slot: usize) -> usize {
    2 * slot + 2
}
