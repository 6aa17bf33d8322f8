//! The delayed-action queue.
//!
//! One min-heap keyed by due instant holds every deferred piece of work of the runtime:
//! world event firings, ban expiries and flood-warning expiries. Entries due at the same
//! instant come out in insertion order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::time::Instant;

use crate::chat::ban::{BanIdentity, BanTier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayedAction {
    /// Fire the registered world event at this index.
    WorldEvent(usize),
    LiftBan { tier: BanTier, identity: BanIdentity },
    ClearFloodWarning { channel: String, user_id: String, generation: u64 },
}

#[derive(Debug)]
struct Entry {
    due: Instant,
    seq: u64,
    action: DelayedAction,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // reversed: BinaryHeap is a max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub struct EventScheduler {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

impl EventScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due: Instant, action: DelayedAction) {
        self.seq += 1;
        self.heap.push(Entry {
            due,
            seq: self.seq,
            action,
        });
    }

    /// Instant of the earliest pending action.
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.due)
    }

    /// Pop the earliest action if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(Instant, DelayedAction)> {
        if self.heap.peek()?.due > now {
            return None;
        }
        self.heap.pop().map(|e| (e.due, e.action))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_due_order_then_insertion_order() {
        let now = Instant::now();
        let mut q = EventScheduler::new();
        q.schedule(now + Duration::from_secs(5), DelayedAction::WorldEvent(5));
        q.schedule(now + Duration::from_secs(1), DelayedAction::WorldEvent(1));
        q.schedule(now + Duration::from_secs(1), DelayedAction::WorldEvent(2));
        q.schedule(now, DelayedAction::WorldEvent(0));
        assert_eq!(q.next_due(), Some(now));

        let later = now + Duration::from_secs(10);
        let order: Vec<DelayedAction> = std::iter::from_fn(|| q.pop_due(later).map(|(_, a)| a)).collect();
        assert_eq!(
            order,
            vec![
                DelayedAction::WorldEvent(0),
                DelayedAction::WorldEvent(1),
                DelayedAction::WorldEvent(2),
                DelayedAction::WorldEvent(5),
            ]
        );
    }

    #[test]
    fn nothing_pops_before_due() {
        let now = Instant::now();
        let mut q = EventScheduler::new();
        q.schedule(now + Duration::from_secs(3), DelayedAction::WorldEvent(0));
        assert!(q.pop_due(now).is_none());
        assert!(q.pop_due(now + Duration::from_secs(2)).is_none());
        assert!(q.pop_due(now + Duration::from_secs(3)).is_some());
        assert!(q.is_empty());
    }
}
