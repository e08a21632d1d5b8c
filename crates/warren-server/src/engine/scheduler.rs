// ============================================
// File: crates/warren-server/src/engine/scheduler.rs
// ============================================
//! # Wake-up Scheduler
//!
//! ## Creation Reason
//! Every client instance owes the engine a wake-up at an absolute time
//! (keepalive, rekey, retransmit). The event loop turns the earliest
//! wake-up into its wait timeout, so the scheduler must answer
//! "who is next" cheaply and support in-place updates.
//!
//! ## Main Functionality
//! - `WakeupScheduler`: indexed binary min-heap keyed by `Instant`
//! - `schedule` (insert or update), `remove`, `peek_earliest`, `pop_due`
//! - One entry per instance, located in O(log N) via a position index
//!
//! ## ⚠️ Important Note for Next Developer
//! - The position index must stay consistent through every sift; all
//!   heap moves go through `swap_entries`
//! - `pop_due` hands back instance ids, not references; the caller
//!   resolves them against the registry (they may have halted)

use std::collections::HashMap;
use std::time::Instant;

use super::instance::InstanceId;

// ============================================
// WakeupScheduler
// ============================================

#[derive(Debug, Clone, Copy)]
struct Entry {
    wakeup: Instant,
    id: InstanceId,
}

/// Indexed min-heap of per-instance wake-up times.
///
/// # Example
/// ```
/// use warren_server::engine::scheduler::WakeupScheduler;
/// use std::time::{Duration, Instant};
///
/// let mut sched = WakeupScheduler::new();
/// let now = Instant::now();
///
/// sched.schedule(1, now + Duration::from_secs(5));
/// sched.schedule(2, now + Duration::from_secs(1));
///
/// assert_eq!(sched.peek_earliest().map(|(id, _)| id), Some(2));
/// ```
#[derive(Debug, Default)]
pub struct WakeupScheduler {
    heap: Vec<Entry>,
    /// Back-index: instance id -> heap position.
    pos: HashMap<InstanceId, usize>,
}

impl WakeupScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scheduled instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` when nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Returns `true` if `id` has a scheduled wake-up.
    #[must_use]
    pub fn contains(&self, id: InstanceId) -> bool {
        self.pos.contains_key(&id)
    }

    /// Inserts or updates the wake-up for `id`.
    ///
    /// Each instance has at most one entry; scheduling an existing id
    /// moves its entry in place.
    pub fn schedule(&mut self, id: InstanceId, wakeup: Instant) {
        if let Some(&i) = self.pos.get(&id) {
            let old = self.heap[i].wakeup;
            self.heap[i].wakeup = wakeup;
            if wakeup < old {
                self.sift_up(i);
            } else {
                self.sift_down(i);
            }
        } else {
            self.heap.push(Entry { wakeup, id });
            let i = self.heap.len() - 1;
            self.pos.insert(id, i);
            self.sift_up(i);
        }
    }

    /// Removes the entry for `id`, if any.
    pub fn remove(&mut self, id: InstanceId) -> bool {
        let Some(i) = self.pos.remove(&id) else {
            return false;
        };

        let last = self.heap.len() - 1;
        if i != last {
            self.heap.swap(i, last);
            self.pos.insert(self.heap[i].id, i);
        }
        self.heap.pop();

        if i < self.heap.len() {
            // The displaced entry may need to move either way
            self.sift_up(i);
            self.sift_down(i);
        }
        true
    }

    /// Returns the instance with the earliest wake-up, without removing it.
    #[must_use]
    pub fn peek_earliest(&self) -> Option<(InstanceId, Instant)> {
        self.heap.first().map(|e| (e.id, e.wakeup))
    }

    /// Removes and returns every instance whose wake-up is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<InstanceId> {
        let mut due = Vec::new();
        while let Some(&Entry { wakeup, id }) = self.heap.first() {
            if wakeup > now {
                break;
            }
            self.remove(id);
            due.push(id);
        }
        due
    }

    // ========================================
    // Heap Maintenance
    // ========================================

    fn swap_entries(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.pos.insert(self.heap[a].id, a);
        self.pos.insert(self.heap[b].id, b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].wakeup < self.heap[parent].wakeup {
                self.swap_entries(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;

            if left < self.heap.len() && self.heap[left].wakeup < self.heap[smallest].wakeup {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right].wakeup < self.heap[smallest].wakeup {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap_entries(i, smallest);
            i = smallest;
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn t(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn test_peek_is_minimum() {
        let mut sched = WakeupScheduler::new();
        let base = Instant::now();

        sched.schedule(1, t(base, 30));
        sched.schedule(2, t(base, 10));
        sched.schedule(3, t(base, 20));

        assert_eq!(sched.peek_earliest(), Some((2, t(base, 10))));
        assert_eq!(sched.len(), 3);
    }

    #[test]
    fn test_new_earliest_does_not_corrupt_heap() {
        let mut sched = WakeupScheduler::new();
        let base = Instant::now();

        for id in 0..16 {
            sched.schedule(id, t(base, 100 + id));
        }
        sched.schedule(99, t(base, 1));
        assert_eq!(sched.peek_earliest().map(|(id, _)| id), Some(99));

        // Draining yields everything in time order
        let mut order = Vec::new();
        while let Some((id, at)) = sched.peek_earliest() {
            sched.remove(id);
            order.push(at);
        }
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
    }

    #[test]
    fn test_update_in_place() {
        let mut sched = WakeupScheduler::new();
        let base = Instant::now();

        sched.schedule(1, t(base, 10));
        sched.schedule(2, t(base, 20));
        assert_eq!(sched.len(), 2);

        // Push instance 1 later; instance 2 becomes earliest
        sched.schedule(1, t(base, 30));
        assert_eq!(sched.len(), 2);
        assert_eq!(sched.peek_earliest().map(|(id, _)| id), Some(2));

        // Pull instance 1 earlier again
        sched.schedule(1, t(base, 5));
        assert_eq!(sched.peek_earliest().map(|(id, _)| id), Some(1));
    }

    #[test]
    fn test_remove() {
        let mut sched = WakeupScheduler::new();
        let base = Instant::now();

        sched.schedule(1, t(base, 10));
        sched.schedule(2, t(base, 20));
        sched.schedule(3, t(base, 30));

        assert!(sched.remove(1));
        assert!(!sched.remove(1));
        assert_eq!(sched.peek_earliest().map(|(id, _)| id), Some(2));
        assert!(!sched.contains(1));
    }

    #[test]
    fn test_pop_due() {
        let mut sched = WakeupScheduler::new();
        let base = Instant::now();

        sched.schedule(1, t(base, 1));
        sched.schedule(2, t(base, 2));
        sched.schedule(3, t(base, 60));

        let due = sched.pop_due(t(base, 5));
        assert_eq!(due, vec![1, 2]);
        assert_eq!(sched.len(), 1);
        assert!(sched.contains(3));

        assert!(sched.pop_due(t(base, 5)).is_empty());
    }

    #[test]
    fn test_empty_peek() {
        let sched = WakeupScheduler::new();
        assert!(sched.peek_earliest().is_none());
        assert!(sched.is_empty());
    }
}
