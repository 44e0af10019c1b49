//! Debounce and periodic timers, driven by the control context.
//!
//! Timers never run on their own thread. The [`Dispatcher`](crate::Dispatcher)
//! asks for [`next_deadline`](TimerSet::next_deadline) to bound its wait on
//! the result channel and calls [`fire_due`](TimerSet::fire_due) whenever it
//! wakes, so every timer-triggered dispatch is serialized with scheduling and
//! cancellation calls.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use dispatch_core::TaskId;

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Single-shot; removed when it fires.
    Debounce,
    /// Re-arms itself every `interval`.
    Periodic { interval: Duration },
}

#[derive(Debug)]
struct TimerEntry {
    kind: TimerKind,
    deadline: Instant,
    generation: u64,
}

/// Heap slot. A slot whose generation no longer matches the live entry is
/// stale (the timer was re-armed or disarmed) and is skipped when popped.
#[derive(Debug, PartialEq, Eq)]
struct HeapSlot {
    deadline: Instant,
    generation: u64,
    id: TaskId,
}

// Reverse ordering for min-heap (earliest deadline first)
impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Stand-in for "never" when a deadline cannot be represented.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// `now + delay`, saturating to a deadline decades out instead of
/// overflowing `Instant`.
pub(crate) fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// At most one timer per task id.
#[derive(Debug, Default)]
pub struct TimerSet {
    timers: HashMap<TaskId, TimerEntry>,
    heap: BinaryHeap<HeapSlot>,
    next_generation: u64,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a single-shot timer. Re-arming an id that is still pending resets
    /// its deadline instead of stacking a second timer.
    pub fn arm_debounce(&mut self, id: TaskId, delay: Duration, now: Instant) {
        self.arm(id, TimerKind::Debounce, deadline_after(now, delay));
    }

    /// Arm a repeating timer whose first tick is one interval from `now`.
    pub fn arm_periodic(&mut self, id: TaskId, interval: Duration, now: Instant) {
        self.arm(id, TimerKind::Periodic { interval }, deadline_after(now, interval));
    }

    fn arm(&mut self, id: TaskId, kind: TimerKind, deadline: Instant) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.timers.insert(id, TimerEntry { kind, deadline, generation });
        self.heap.push(HeapSlot { deadline, generation, id });
    }

    /// Stop and release the timer for `id`. Returns whether one existed.
    pub fn disarm(&mut self, id: TaskId) -> bool {
        // The heap slot goes stale and is discarded lazily.
        self.timers.remove(&id).is_some()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn kind(&self, id: TaskId) -> Option<TimerKind> {
        self.timers.get(&id).map(|t| t.kind)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
        self.heap.clear();
    }

    fn is_current(&self, slot: &HeapSlot) -> bool {
        self.timers
            .get(&slot.id)
            .is_some_and(|t| t.generation == slot.generation)
    }

    /// Earliest live deadline, discarding stale heap slots on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(slot) = self.heap.peek() {
            if self.is_current(slot) {
                return Some(slot.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop every timer due at `now`, in deadline order.
    ///
    /// Debounce timers are removed. Periodic timers are re-armed one interval
    /// after their previous deadline; ticks missed while the control context
    /// was busy are skipped rather than replayed in a burst.
    pub fn fire_due(&mut self, now: Instant) -> Vec<(TaskId, TimerKind)> {
        let mut fired = Vec::new();

        while let Some(slot) = self.heap.peek() {
            if slot.deadline > now {
                break;
            }
            let slot = match self.heap.pop() {
                Some(slot) => slot,
                None => break,
            };
            if !self.is_current(&slot) {
                continue;
            }

            let kind = match self.timers.get(&slot.id) {
                Some(entry) => entry.kind,
                None => continue,
            };
            match kind {
                TimerKind::Debounce => {
                    self.timers.remove(&slot.id);
                }
                TimerKind::Periodic { interval } => {
                    let mut next = deadline_after(slot.deadline, interval);
                    if next <= now {
                        next = deadline_after(now, interval);
                    }
                    self.arm(slot.id, kind, next);
                }
            }
            fired.push((slot.id, kind));
        }

        fired
    }
}
