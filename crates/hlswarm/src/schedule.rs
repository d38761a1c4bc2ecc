// Deferred continuation queue shared by clients and the fleet manager.
//
// Entries fire in deadline order; entries with equal deadlines fire in the
// order they were scheduled.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::time::Instant;

/// Longest delay a timer can have; later deadlines are clamped to it.
const MAX_DELAY: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Handle to a scheduled entry, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Entry<T> {
    deadline: Instant,
    id: TimerId,
    payload: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.id).cmp(&(other.deadline, other.id))
    }
}

/// Min-heap of pending timers keyed by `(deadline, scheduling order)`.
#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_id: 0,
        }
    }

    /// Schedules `payload` to fire `after` the current instant.
    pub fn schedule(&mut self, after: Duration, payload: T) -> TimerId {
        self.schedule_at(Instant::now() + after.min(MAX_DELAY), payload)
    }

    pub fn schedule_at(&mut self, deadline: Instant, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse(Entry {
            deadline,
            id,
            payload,
        }));
        id
    }

    /// Deadline of the earliest pending entry.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Removes and returns the earliest entry whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.deadline <= now => {
                self.heap.pop().map(|Reverse(entry)| entry.payload)
            }
            _ => None,
        }
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.heap.retain(|Reverse(entry)| entry.id != id);
    }

    /// Drops every pending entry matching `predicate`.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&T) -> bool) {
        self.heap.retain(|Reverse(entry)| !predicate(&entry.payload));
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Sleeps until `deadline`, or forever when there is nothing scheduled.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
