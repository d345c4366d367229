use chrono::{DateTime, TimeDelta, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub(crate) type TimerId = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TimerAction {
    /// The scheduled occurrence of a transient scenario begins
    Start {
        scenario: Arc<str>,
        occurrence: DateTime<Utc>,
    },
    /// An active scenario reaches the end of its duration
    End { scenario: Arc<str> },
}

#[derive(Clone)]
struct PendingTimer {
    id: TimerId,
    deadline: Instant,
}

impl Eq for PendingTimer {}

impl PartialEq<Self> for PendingTimer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl PartialOrd<Self> for PendingTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTimer {
    // Reversed, so the earliest deadline sits on top of the max-heap (ties go to the timer that
    // was armed first)
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Deadline-ordered timers with O(1) cancellation
///
/// Cancelled timers stay in the heap until they reach the top, where they are discarded because
/// they are no longer live.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<PendingTimer>,
    live: HashMap<TimerId, TimerAction>,
    next_id: TimerId,
}

impl TimerQueue {
    pub(crate) fn arm(&mut self, deadline: Instant, action: TimerAction) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(PendingTimer { id, deadline });
        self.live.insert(id, action);
        id
    }

    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        self.live.remove(&id).is_some()
    }

    pub(crate) fn cancel_all(&mut self) {
        self.live.clear();
        self.heap.clear();
    }

    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if self.live.contains_key(&top.id) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }

        None
    }

    /// Removes and returns every live timer whose deadline is not after `now`, in deadline order
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<(TimerId, TimerAction)> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }

            let id = top.id;
            self.heap.pop();
            if let Some(action) = self.live.remove(&id) {
                due.push((id, action));
            }
        }

        due
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.live.len()
    }
}

/// Maps wall-clock time onto the tokio clock, so schedules follow tokio's (possibly paused)
/// notion of time
#[derive(Clone, Copy, Debug)]
pub(crate) struct Clock {
    wall_origin: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    pub(crate) fn starting_at(wall_origin: DateTime<Utc>) -> Self {
        Self {
            wall_origin,
            origin: Instant::now(),
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.origin.elapsed()).unwrap_or(TimeDelta::zero());
        self.wall_origin + elapsed
    }

    /// The tokio instant at which the wall clock reads `at` (now, if `at` already passed)
    pub(crate) fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        let wait = (at - self.now()).to_std().unwrap_or(Duration::ZERO);
        Instant::now() + wait
    }
}
