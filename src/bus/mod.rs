/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable publish/subscribe message bus.
//!
//! A [`Bus`] is one subscriber's handle onto a bus: it registers interest in thread ids (or in broader
//! [`Filter`]s), publishes payloads under thread ids, and blocks in [`next_event`](Bus::next_event) until
//! something it subscribed to arrives. Bus handles are opened through a [`BusFactory`], so every
//! coprotocol instance gets a subscriber of its own.
//!
//! Two implementations are provided:
//! 1. [`in_memory`]: a process-local hub with many logical subscriber sessions.
//! 2. [`remote`]: a client tunnelling the same operations over a persistent TCP connection to a
//!    [`server`] that hosts an in-memory hub.
//!
//! ## Cancellation
//!
//! [`abort`](Bus::abort) (or an [`AbortHandle`] obtained from the bus and moved to another thread) wakes
//! every call currently blocked in `next_event` on that subscriber with [`BusError::Cancelled`], which is
//! distinct from [`BusError::Timeout`].

pub mod in_memory;

pub mod remote;

pub mod server;

pub mod frames;

pub(crate) mod queue;

pub mod stream;

use std::{fmt, io, sync::Arc, time::Duration};

use crate::types::crypto_primitives::{verkey_to_base64, VerifyingKey};

use queue::EventQueue;

/// A payload delivered under the thread (or binding) id it was published to.
#[derive(Clone, PartialEq, Eq)]
pub struct BusEvent {
    pub thread_id: String,
    pub payload: Vec<u8>,
}

impl fmt::Debug for BusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusEvent")
            .field("thread_id", &self.thread_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Interest in a protocol's traffic before any thread id is known.
///
/// An empty key list matches any key. An empty protocol list matches any protocol.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub sender_keys: Vec<VerifyingKey>,
    pub recipient_keys: Vec<VerifyingKey>,
    pub protocols: Vec<String>,
}

impl Filter {
    pub fn matches(
        &self,
        sender: Option<&VerifyingKey>,
        recipient: &VerifyingKey,
        protocol: &str,
    ) -> bool {
        let sender_ok = self.sender_keys.is_empty()
            || sender.is_some_and(|sender| self.sender_keys.contains(sender));
        let recipient_ok = self.recipient_keys.is_empty() || self.recipient_keys.contains(recipient);
        let protocol_ok =
            self.protocols.is_empty() || self.protocols.iter().any(|p| p == protocol);
        sender_ok && recipient_ok && protocol_ok
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = |keys: &[VerifyingKey]| keys.iter().map(verkey_to_base64).collect::<Vec<_>>();
        f.debug_struct("Filter")
            .field("sender_keys", &keys(&self.sender_keys))
            .field("recipient_keys", &keys(&self.recipient_keys))
            .field("protocols", &self.protocols)
            .finish()
    }
}

/// One subscriber's handle onto a publish/subscribe bus.
pub trait Bus: Send {
    /// Register interest in every future publish under `thread_id`. Idempotent.
    fn subscribe(&mut self, thread_id: &str) -> Result<bool, BusError>;

    /// Register interest in every delivery matching `filter`. Returns the binding ids, which behave like
    /// thread ids for [`unsubscribe`](Self::unsubscribe) purposes.
    fn subscribe_by_filter(&mut self, filter: &Filter) -> Result<(bool, Vec<String>), BusError>;

    /// Drop interest in `thread_id`. Unknown ids are a no-op.
    fn unsubscribe(&mut self, thread_id: &str) -> Result<(), BusError>;

    /// Drop interest in every id in `thread_ids`. Unknown ids are a no-op.
    fn unsubscribe_many(&mut self, thread_ids: &[String]) -> Result<(), BusError> {
        for thread_id in thread_ids {
            self.unsubscribe(thread_id)?;
        }
        Ok(())
    }

    /// Deliver `payload` to every current subscriber of `thread_id`. Returns the number of recipients,
    /// which may be 0.
    fn publish(&mut self, thread_id: &str, payload: Vec<u8>) -> Result<usize, BusError>;

    /// Block until an event arrives, `timeout` elapses (never, if `None`), or the bus is aborted.
    fn next_event(&mut self, timeout: Option<Duration>) -> Result<BusEvent, BusError>;

    /// Wake every blocked [`next_event`](Self::next_event) call on this subscriber with a cancellation.
    fn abort(&self) {
        self.abort_handle().abort()
    }

    /// A handle that can abort this subscriber from another thread.
    fn abort_handle(&self) -> AbortHandle;
}

/// Opens fresh [`Bus`] subscribers.
pub trait BusFactory: Clone + Send + 'static {
    type Bus: Bus + 'static;

    fn open(&self) -> Result<Self::Bus, BusError>;
}

/// Out-of-band cancellation channel for a [`Bus`] subscriber.
#[derive(Clone)]
pub struct AbortHandle(Arc<EventQueue>);

impl AbortHandle {
    pub(crate) fn new(queue: Arc<EventQueue>) -> Self {
        Self(queue)
    }

    pub fn abort(&self) {
        self.0.abort()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no event arrived before the timeout")]
    Timeout,
    #[error("the wait was cancelled by an abort")]
    Cancelled,
    #[error("the bus connection is closed")]
    Disconnected,
    #[error("bus request failed: {problem_code}: {explain}")]
    Rpc {
        problem_code: String,
        explain: String,
    },
    #[error("unexpected bus frame: {0}")]
    UnexpectedFrame(String),
    #[error("bus frame could not be encoded or decoded: {0}")]
    Encoding(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
