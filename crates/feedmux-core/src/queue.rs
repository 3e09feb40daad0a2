//! Thread-safe FIFO event queue with readiness signalling
//!
//! The reactor and the worker each own one [`EventQueue`]. Producers push from
//! any thread; the owning side drains everything at once. The queue's readiness
//! token is signalled only when the queue goes from empty to non-empty, so a
//! burst of pushes costs a single wakeup.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::errors::QueueError;
use crate::notifier::Readiness;

struct QueueState<T> {
    events: VecDeque<T>,
    closed: bool,
}

/// Multi-producer FIFO queue drained by a single consumer
pub struct EventQueue<T> {
    state: Mutex<QueueState<T>>,
    readiness: Readiness,
    wakeups: AtomicU64,
}

impl<T> EventQueue<T> {
    pub fn new(readiness: Readiness) -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                closed: false,
            }),
            readiness,
            wakeups: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event; a closed queue hands the event back
    pub fn push(&self, event: T) -> Result<(), QueueError<T>> {
        let was_empty = {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed(event));
            }
            let was_empty = state.events.is_empty();
            state.events.push_back(event);
            was_empty
        };

        if was_empty {
            self.wakeups.fetch_add(1, Ordering::Relaxed);
            self.readiness.signal();
        }
        Ok(())
    }

    /// Remove and return every queued event in FIFO order
    pub fn drain_all(&self) -> Vec<T> {
        let mut state = self.lock();
        Vec::from(std::mem::take(&mut state.events))
    }

    /// Refuse further pushes and return whatever was still queued
    pub fn close(&self) -> Vec<T> {
        let mut state = self.lock();
        state.closed = true;
        Vec::from(std::mem::take(&mut state.events))
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// Number of empty-to-non-empty transitions signalled so far
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}

impl<T> core::fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("EventQueue")
            .field("len", &state.events.len())
            .field("closed", &state.closed)
            .field("token", &self.readiness.token())
            .finish()
    }
}
