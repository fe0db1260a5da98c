use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use ordered_float::NotNan;

use crate::{EntityId, Error};

/// A pending occurrence in the future-event list.
///
/// The engine orders events by time only; `kind` is an opaque tag that the
/// driving script interprets when the event comes back from
/// [`advance`](crate::SimulationClock::advance).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event<K> {
    /// Caller-defined tag saying what this occurrence means to the model.
    pub kind: K,
    /// Absolute simulation time at which the event occurs.
    pub time: f64,
    /// Entity the event concerns.
    pub entity: EntityId,
}

/// Entry stored in the queue: the event plus the insertion sequence number
/// that breaks ties between equal-time events.
#[derive(Debug)]
struct EventEntry<K> {
    time: Reverse<NotNan<f64>>,
    seq: Reverse<u64>,
    event: Event<K>,
}

impl<K> PartialEq for EventEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl<K> Eq for EventEntry<K> {}

impl<K> PartialOrd for EventEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for EventEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// The future-event list: a min-priority queue of pending events ordered
/// by occurrence time.
///
/// Events with equal times extract in insertion order (FIFO). The tie
/// break is implemented as a monotonically increasing sequence number used
/// as a secondary sort key, so the extraction order is a deterministic
/// total order regardless of how the underlying heap arranges its nodes.
pub struct EventQueue<K> {
    heap: BinaryHeap<EventEntry<K>>,
    next_seq: u64,
}

impl<K> Default for EventQueue<K> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }
}

impl<K> EventQueue<K> {
    /// Inserts an event, keyed by its absolute occurrence time.
    ///
    /// # Panics
    ///
    /// The event's time must be a number; the clock validates delays
    /// before resolving them to absolute times, so a NaN here is a bug in
    /// the caller.
    pub fn insert(&mut self, event: Event<K>) {
        let time = NotNan::new(event.time).expect("event time must be a number");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(EventEntry {
            time: Reverse(time),
            seq: Reverse(seq),
            event,
        });
    }

    /// Removes and returns the event with the smallest occurrence time;
    /// FIFO among events with equal times.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyQueue`] if no events are pending.
    pub fn extract_min(&mut self) -> Result<Event<K>, Error> {
        self.heap
            .pop()
            .map(|entry| entry.event)
            .ok_or(Error::EmptyQueue)
    }

    /// Number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no events are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
