/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-subscriber event queue shared by every [`Bus`](super::Bus) implementation.
//!
//! A queue is a `VecDeque` of pending events behind a `Mutex`, plus a `Condvar` that blocked readers
//! wait on. [`abort`](EventQueue::abort) bumps an "abort generation" and wakes every waiter: a waiter that
//! observes a generation different from the one it started with returns
//! [`BusError::Cancelled`](super::BusError::Cancelled) instead of data. Aborting an idle queue does not
//! affect later reads.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use super::{BusError, BusEvent};

#[derive(Default)]
pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<BusEvent>,
    abort_generation: u64,
    closed: bool,
}

impl EventQueue {
    pub(crate) fn new() -> Arc<EventQueue> {
        Arc::new(EventQueue::default())
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, event: BusEvent) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.events.push_back(event);
        self.ready.notify_all();
    }

    /// Wake every blocked [`pop`](Self::pop) with a cancellation.
    pub(crate) fn abort(&self) {
        let mut state = self.lock();
        state.abort_generation = state.abort_generation.wrapping_add(1);
        self.ready.notify_all();
    }

    /// Mark the queue as disconnected. Pending events can still be drained.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.ready.notify_all();
    }

    /// Drop all pending events whose thread id satisfies `predicate`.
    pub(crate) fn discard(&self, predicate: impl Fn(&BusEvent) -> bool) {
        self.lock().events.retain(|event| !predicate(event));
    }

    /// Take the oldest pending event, waiting at most `timeout` (forever if `None`) for one to arrive.
    pub(crate) fn pop(&self, timeout: Option<Duration>) -> Result<BusEvent, BusError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock();
        let generation = state.abort_generation;

        loop {
            if state.abort_generation != generation {
                return Err(BusError::Cancelled);
            }
            if let Some(event) = state.events.pop_front() {
                return Ok(event);
            }
            if state.closed {
                return Err(BusError::Disconnected);
            }

            state = match deadline {
                None => self
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BusError::Timeout);
                    }
                    self.ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}
