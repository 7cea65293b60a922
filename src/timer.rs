use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifier handed out by [`Reactor::run_after`] and [`Reactor::run_every`],
/// usable with [`Reactor::cancel_timer`].
///
/// [`Reactor::run_after`]: crate::reactor::Reactor::run_after
/// [`Reactor::run_every`]: crate::reactor::Reactor::run_every
/// [`Reactor::cancel_timer`]: crate::reactor::Reactor::cancel_timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct TimerEntry {
    pub id: TimerId,
    pub expiry: Instant,
    pub period: Option<Duration>,
    pub callback: TimerCallback,
}

// Heap order ignores the callback; expiry first, id breaks ties so timers
// scheduled earlier pop first.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expiry.cmp(&other.expiry).then(self.id.cmp(&other.id))
    }
}

/// Min-heap of pending timers plus the table of live timer ids.
///
/// Cancellation removes the id from the live table; the matching heap entry
/// is discarded lazily when it reaches the top. An entry already popped for
/// the current loop pass is suppressed by a liveness check immediately
/// before invocation, so cancel-before-invoke always wins.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    live: HashSet<TimerId>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            next_id: 1,
        }
    }

    pub fn schedule(
        &mut self,
        expiry: Instant,
        period: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.live.insert(id);
        self.heap.push(Reverse(TimerEntry {
            id,
            expiry,
            period,
            callback,
        }));
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.live.remove(&id);
    }

    pub fn is_live(&self, id: TimerId) -> bool {
        self.live.contains(&id)
    }

    /// Marks a one-shot timer as finished after its callback ran.
    pub fn retire(&mut self, id: TimerId) {
        self.live.remove(&id);
    }

    /// Puts a repeating timer back with its next expiry.
    pub fn reschedule(&mut self, entry: TimerEntry, expiry: Instant) {
        self.heap.push(Reverse(TimerEntry { expiry, ..entry }));
    }

    /// Pops every live timer with `expiry <= now`, earliest first.
    /// Popped entries stay live until retired or rescheduled.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut expired = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if !self.live.contains(&top.id) {
                self.heap.pop();
                continue;
            }
            if top.expiry > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked entry");
            expired.push(entry);
        }
        expired
    }

    /// Time until the earliest live timer, or `None` when the heap is empty.
    pub fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if !self.live.contains(&top.id) {
                self.heap.pop();
                continue;
            }
            return Some(top.expiry.saturating_duration_since(now));
        }
        None
    }

    pub fn active_count(&self) -> usize {
        self.live.len()
    }
}
