use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use crate::domain::Event;

/// Bounded FIFO of the most recent events, replayed to newly attached viewers.
///
/// Invariant: `len() <= capacity()`; contents are in insertion order.
#[derive(Debug)]
pub struct HistoryBuffer {
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append, evicting the oldest entries once over capacity.
    pub fn append(&self, event: Event) {
        let mut events = self.lock();
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
    }

    /// Current contents, oldest first. Owned copy: callers cannot mutate the buffer.
    pub fn snapshot(&self) -> Vec<Event> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        // A panic mid-append cannot leave the deque half-updated.
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}
