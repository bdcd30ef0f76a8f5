use anyhow::bail;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// An opaque, generation-stamped reference to a scheduled timer entry.
///
/// A handle is only ever valid for the entry it was issued for: queue slots are reused, but
///  each reuse bumps the slot's generation, so a stale handle can never alias a newer entry.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TimerHandle {
    slot: u32,
    generation: u32,
}

struct TimerEntry<T> {
    deadline: Instant,
    interval: Option<Duration>,
    /// taken out while the entry's callback is executing
    payload: Option<T>,
    cancelled: bool,
}

struct TimerSlot<T> {
    generation: u32,
    entry: Option<TimerEntry<T>>,
}

/// Heap ordering is by deadline, with the insertion sequence as a tie breaker so that timers
///  scheduled for the same instant fire in scheduling order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
struct HeapKey {
    deadline: Instant,
    insertion_seq: u64,
    slot: u32,
    generation: u32,
}

/// A priority-queue backed scheduler of one-shot and recurring entries, keyed by a monotonic
///  `tokio::time::Instant`.
///
/// Cancellation is lazy: a cancelled entry stays in heap storage until it bubbles to the top
///  and is popped, but it is never fired. This keeps `cancel` O(1) and never disturbs the heap
///  invariant, which in turn makes cancellation safe from inside a firing callback - including
///  a callback cancelling itself.
///
/// Recurring entries re-arm from their *previous scheduled deadline*, not from `now`, so a
///  late `process` call does not accumulate drift.
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<HeapKey>>,
    slots: Vec<TimerSlot<T>>,
    free_slots: Vec<u32>,
    insertion_seq: u64,
    live: usize,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> TimerQueue<T> {
        TimerQueue {
            heap: BinaryHeap::new(),
            slots: Vec::new(),
            free_slots: Vec::new(),
            insertion_seq: 0,
            live: 0,
        }
    }

    /// number of scheduled entries that are neither fired nor cancelled
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Schedule an entry. A `Some` interval makes it recurring; the interval must be
    ///  non-zero - scheduling a zero interval is a programming error and is rejected.
    pub fn schedule(
        &mut self,
        deadline: Instant,
        interval: Option<Duration>,
        payload: T,
    ) -> anyhow::Result<TimerHandle> {
        if let Some(interval) = interval {
            debug_assert!(!interval.is_zero(), "recurring timer with zero interval");
            if interval.is_zero() {
                bail!("recurring timer scheduled with zero interval");
            }
        }

        let entry = TimerEntry {
            deadline,
            interval,
            payload: Some(payload),
            cancelled: false,
        };

        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot as usize].entry = Some(entry);
                slot
            }
            None => {
                self.slots.push(TimerSlot {
                    generation: 0,
                    entry: Some(entry),
                });
                (self.slots.len() - 1) as u32
            }
        };
        let generation = self.slots[slot as usize].generation;

        self.insertion_seq += 1;
        self.heap.push(Reverse(HeapKey {
            deadline,
            insertion_seq: self.insertion_seq,
            slot,
            generation,
        }));
        self.live += 1;

        trace!("scheduled timer {}/{} for {:?}", slot, generation, deadline);
        Ok(TimerHandle { slot, generation })
    }

    /// convenience for the ubiquitous one-shot case, which cannot fail validation
    pub fn schedule_once(&mut self, deadline: Instant, payload: T) -> TimerHandle {
        self.schedule(deadline, None, payload)
            .expect("one-shot schedule validates nothing and cannot fail")
    }

    /// Cancel the entry behind `handle`. Returns `false` for stale or already-cancelled
    ///  handles, which are harmless no-ops.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.slot as usize) else {
            return false;
        };
        if slot.generation != handle.generation {
            return false;
        }
        let Some(entry) = slot.entry.as_mut() else {
            return false;
        };
        if entry.cancelled {
            return false;
        }

        entry.cancelled = true;
        self.live -= 1;
        trace!("cancelled timer {}/{}", handle.slot, handle.generation);
        true
    }

    /// Fire every entry whose deadline is at or before `now`, in deadline order, and return
    ///  the number fired. `fire` gets the queue itself so callbacks can schedule and cancel
    ///  re-entrantly; entries scheduled by a callback for a deadline at or before `now` fire
    ///  within the same call.
    pub fn process(
        &mut self,
        now: Instant,
        mut fire: impl FnMut(&mut Self, TimerHandle, &mut T),
    ) -> usize {
        let mut fired = 0;

        loop {
            let key = match self.heap.peek() {
                Some(&Reverse(key)) if key.deadline <= now => key,
                _ => break,
            };
            self.heap.pop();

            let slot_idx = key.slot as usize;
            if self.slots[slot_idx].generation != key.generation {
                // stale heap entry for a slot that has been recycled
                continue;
            }
            let Some(entry) = self.slots[slot_idx].entry.as_mut() else {
                continue;
            };
            if entry.cancelled {
                self.free_slot(slot_idx);
                continue;
            }

            let mut payload = entry.payload.take()
                .expect("pending timer entry without payload");
            let interval = entry.interval;
            let scheduled_deadline = entry.deadline;
            let handle = TimerHandle { slot: key.slot, generation: key.generation };

            fire(self, handle, &mut payload);
            fired += 1;

            // the callback may have cancelled this very entry
            let slot = &mut self.slots[slot_idx];
            match slot.entry.as_mut() {
                Some(entry) if !entry.cancelled && interval.is_some() => {
                    // re-arm from the previous deadline to avoid drift under late processing
                    let next_deadline = scheduled_deadline + interval
                        .expect("checked above");
                    entry.deadline = next_deadline;
                    entry.payload = Some(payload);

                    self.insertion_seq += 1;
                    self.heap.push(Reverse(HeapKey {
                        deadline: next_deadline,
                        insertion_seq: self.insertion_seq,
                        slot: key.slot,
                        generation: key.generation,
                    }));
                }
                _ => {
                    self.free_slot(slot_idx);
                }
            }
        }

        fired
    }

    /// Time until the earliest live entry is due, `Duration::ZERO` if one is overdue, `None`
    ///  if the queue is empty. Tombstones encountered at the top of the heap are pruned.
    pub fn next_deadline(&mut self, now: Instant) -> Option<Duration> {
        loop {
            let key = match self.heap.peek() {
                Some(&Reverse(key)) => key,
                None => return None,
            };

            let slot_idx = key.slot as usize;
            let is_live = self.slots[slot_idx].generation == key.generation
                && matches!(&self.slots[slot_idx].entry, Some(entry) if !entry.cancelled);

            if is_live {
                return Some(key.deadline.saturating_duration_since(now));
            }

            self.heap.pop();
            if self.slots[slot_idx].generation == key.generation && self.slots[slot_idx].entry.is_some() {
                self.free_slot(slot_idx);
            }
        }
    }

    fn free_slot(&mut self, slot_idx: usize) {
        let slot = &mut self.slots[slot_idx];
        let was_cancelled = matches!(&slot.entry, Some(entry) if entry.cancelled);
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(slot_idx as u32);
        if !was_cancelled {
            // cancelled entries were already counted out when they were cancelled
            self.live -= 1;
        }
    }
}
