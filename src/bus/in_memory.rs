/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A process-local bus: one [`InMemoryBus`] hub, many [`InMemoryBusSession`] subscribers.
//!
//! The hub's subscription table maps every thread id (and filter binding id) to the set of sessions
//! subscribed to it. It is the only state shared between sessions, and is guarded by a single mutex so
//! that sessions on different threads can publish and subscribe concurrently. Each session owns the ids
//! it registered and releases all of them when it is dropped.
//!
//! Besides plain [`publish`](Bus::publish), the hub accepts inbound deliveries through
//! [`route`](InMemoryBus::route): a delivery reaches the sessions subscribed to its thread id as well as
//! every session holding a matching [`Filter`] binding, and each session receives it at most once.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::types::crypto_primitives::VerifyingKey;

use super::{queue::EventQueue, AbortHandle, Bus, BusError, BusEvent, BusFactory, Filter};

type SessionID = u64;

/// Addressing facts about an inbound message, extracted by whoever unpacked it.
#[derive(Clone, Debug)]
pub struct Routing {
    /// The message's `~thread.thid`, or its `@id` if it has no thread.
    pub thread_id: String,
    pub sender: Option<VerifyingKey>,
    pub recipient: VerifyingKey,
    pub protocol: String,
}

#[derive(Default)]
struct Registry {
    next_session: SessionID,
    sessions: HashMap<SessionID, Arc<EventQueue>>,
    topics: HashMap<String, BTreeSet<SessionID>>,
    filters: BTreeMap<String, (SessionID, Filter)>,
}

impl Registry {
    fn add_topic(&mut self, topic: &str, session: SessionID) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(session);
    }

    fn remove_topic(&mut self, topic: &str, session: SessionID) {
        if let Some(sessions) = self.topics.get_mut(topic) {
            sessions.remove(&session);
            if sessions.is_empty() {
                self.topics.remove(topic);
            }
        }
        if self
            .filters
            .get(topic)
            .is_some_and(|(owner, _)| *owner == session)
        {
            self.filters.remove(topic);
        }
    }
}

/// The hub of a process-local bus. Cloning yields another handle onto the same hub.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    registry: Arc<Mutex<Registry>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    /// Open a new subscriber session on this hub.
    pub fn session(&self) -> InMemoryBusSession {
        let queue = EventQueue::new();
        let mut registry = self.lock();
        let id = registry.next_session;
        registry.next_session += 1;
        registry.sessions.insert(id, queue.clone());

        InMemoryBusSession {
            id,
            registry: self.registry.clone(),
            queue,
            owned: BTreeSet::new(),
        }
    }

    /// Deliver an inbound message to every session subscribed to its thread id or holding a filter
    /// binding that matches it. Returns the number of sessions reached.
    pub fn route(&self, routing: &Routing, payload: Vec<u8>) -> usize {
        let registry = self.lock();
        let mut targets: BTreeMap<SessionID, String> = BTreeMap::new();

        if let Some(sessions) = registry.topics.get(&routing.thread_id) {
            for session in sessions {
                targets.insert(*session, routing.thread_id.clone());
            }
        }

        for (binding_id, (session, filter)) in &registry.filters {
            if filter.matches(
                routing.sender.as_ref(),
                &routing.recipient,
                &routing.protocol,
            ) {
                targets
                    .entry(*session)
                    .or_insert_with(|| binding_id.clone());
            }
        }

        let mut delivered = 0;
        for (session, thread_id) in targets {
            if let Some(queue) = registry.sessions.get(&session) {
                queue.push(BusEvent {
                    thread_id,
                    payload: payload.clone(),
                });
                delivered += 1;
            }
        }

        log::trace!(
            "routed delivery for thread {} ({}) to {} session(s)",
            routing.thread_id,
            routing.protocol,
            delivered
        );
        delivered
    }

    /// Number of sessions currently subscribed to `thread_id`.
    pub fn subscriber_count(&self, thread_id: &str) -> usize {
        self.lock().topics.get(thread_id).map_or(0, BTreeSet::len)
    }

    /// Total number of (id, session) subscriptions currently registered on the hub.
    pub fn subscription_count(&self) -> usize {
        self.lock().topics.values().map(BTreeSet::len).sum()
    }

    /// Number of sessions currently open on the hub.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

impl BusFactory for InMemoryBus {
    type Bus = InMemoryBusSession;

    fn open(&self) -> Result<Self::Bus, BusError> {
        Ok(self.session())
    }
}

/// One subscriber of an [`InMemoryBus`].
pub struct InMemoryBusSession {
    id: SessionID,
    registry: Arc<Mutex<Registry>>,
    queue: Arc<EventQueue>,
    owned: BTreeSet<String>,
}

impl InMemoryBusSession {
    pub(crate) fn queue(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }
}

impl Bus for InMemoryBusSession {
    fn subscribe(&mut self, thread_id: &str) -> Result<bool, BusError> {
        lock(&self.registry).add_topic(thread_id, self.id);
        self.owned.insert(thread_id.to_string());
        Ok(true)
    }

    fn subscribe_by_filter(&mut self, filter: &Filter) -> Result<(bool, Vec<String>), BusError> {
        // One binding per protocol name, so that each can be released on its own.
        let per_protocol: Vec<Filter> = if filter.protocols.is_empty() {
            vec![filter.clone()]
        } else {
            filter
                .protocols
                .iter()
                .map(|protocol| Filter {
                    protocols: vec![protocol.clone()],
                    ..filter.clone()
                })
                .collect()
        };

        let mut registry = lock(&self.registry);
        let mut binding_ids = Vec::with_capacity(per_protocol.len());
        for filter in per_protocol {
            let binding_id = format!("binding-{}", uuid::Uuid::new_v4());
            registry.add_topic(&binding_id, self.id);
            registry
                .filters
                .insert(binding_id.clone(), (self.id, filter));
            self.owned.insert(binding_id.clone());
            binding_ids.push(binding_id);
        }
        Ok((true, binding_ids))
    }

    fn unsubscribe(&mut self, thread_id: &str) -> Result<(), BusError> {
        if self.owned.remove(thread_id) {
            lock(&self.registry).remove_topic(thread_id, self.id);
            self.queue.discard(|event| event.thread_id == thread_id);
        }
        Ok(())
    }

    fn publish(&mut self, thread_id: &str, payload: Vec<u8>) -> Result<usize, BusError> {
        let registry = lock(&self.registry);
        let mut recipients = 0;
        if let Some(sessions) = registry.topics.get(thread_id) {
            for session in sessions {
                if let Some(queue) = registry.sessions.get(session) {
                    queue.push(BusEvent {
                        thread_id: thread_id.to_string(),
                        payload: payload.clone(),
                    });
                    recipients += 1;
                }
            }
        }
        Ok(recipients)
    }

    fn next_event(&mut self, timeout: Option<Duration>) -> Result<BusEvent, BusError> {
        self.queue.pop(timeout)
    }

    fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(self.queue.clone())
    }
}

impl Drop for InMemoryBusSession {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        for thread_id in &self.owned {
            registry.remove_topic(thread_id, self.id);
        }
        registry.sessions.remove(&self.id);
        self.queue.close();
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
