/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Scoped, time-bounded request/response sessions layered on a publish/subscribe [`Bus`](crate::bus::Bus).
//!
//! A coprotocol owns a bus subscriber of its own, the set of thread (or binding) ids it subscribed to,
//! and an absolute deadline fixed when it starts. Every variant follows the same lifecycle:
//!
//! ```text
//! Idle --start()--> Running --stop()--> Stopped
//!                      |
//!                      +----abort()---> Aborted
//! ```
//!
//! `Stopped` and `Aborted` are terminal. Stopping is idempotent, and also happens when a coprotocol is
//! dropped, so subscriptions are released even if the logic driving the coprotocol returned early.
//!
//! ## Variants
//!
//! - [`P2PCoprotocol`](p2p::P2PCoprotocol): two parties, a new conversation addressed by keys and
//!   protocol name.
//! - [`ThreadedCoprotocol`](threaded::ThreadedCoprotocol): two parties, a pre-agreed thread id, with
//!   [ordering](ordering::OrderingState) bookkeeping.
//! - [`TheirsCoprotocol`](theirs::TheirsCoprotocol): one initiator, many responders, one shared thread id.
//! - [`Listener`](listener::Listener): a long-lived subscription used to receive the first message of
//!   conversations started by others.
//!
//! ## Outcomes
//!
//! `switch` methods report timeouts, transport failures and cancellations as an [`Outcome`] rather than
//! an error. `Err` is reserved for misuse (e.g., sending before `start`) and for failures of the
//! pluggable capabilities that are not about reaching a peer.

pub(crate) mod base;

pub mod listener;

pub mod ordering;

pub mod p2p;

pub mod theirs;

pub mod threaded;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

pub use crate::transport::Inbound;

use crate::{
    bus::{AbortHandle, BusError},
    messages::envelope::EnvelopeError,
    transport::{CryptoError, TransportError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoprotocolState {
    Idle,
    Running,
    Stopped,
    Aborted,
}

/// The result of a `switch`.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome<T> {
    pub ok: bool,
    pub value: Option<T>,
    pub error: Option<OutcomeError>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutcomeError {
    pub kind: OutcomeErrorKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeErrorKind {
    /// Nobody answered before the coprotocol's deadline.
    Timeout,
    /// The message could not be handed to the peer's endpoint.
    Transport,
    /// The coprotocol was aborted while waiting.
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn success(value: T) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(kind: OutcomeErrorKind, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(OutcomeError {
                kind,
                detail: detail.into(),
            }),
        }
    }

    /// The message went out but nothing came back.
    pub fn no_response(kind: OutcomeErrorKind) -> Self {
        Self {
            ok: true,
            value: None,
            error: Some(OutcomeError {
                kind,
                detail: "no response".to_string(),
            }),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error_kind() == Some(OutcomeErrorKind::Timeout)
    }

    pub fn error_kind(&self) -> Option<OutcomeErrorKind> {
        self.error.as_ref().map(|error| error.kind)
    }

    /// Absorb the peer-facing failures of `err` into an outcome, and pass everything else through.
    pub(crate) fn absorb(err: CoprotocolError) -> Result<Self, CoprotocolError> {
        match err {
            CoprotocolError::Timeout => Ok(Self::failure(OutcomeErrorKind::Timeout, "deadline elapsed")),
            CoprotocolError::Cancelled => {
                Ok(Self::failure(OutcomeErrorKind::Cancelled, "coprotocol aborted"))
            }
            CoprotocolError::Transport(err) => {
                Ok(Self::failure(OutcomeErrorKind::Transport, err.to_string()))
            }
            other => Err(other),
        }
    }
}

/// Aborts a coprotocol from another thread.
///
/// Aborting is sticky: a coprotocol whose handle fired refuses to wait again, even if the abort arrived
/// while it was not waiting.
#[derive(Clone, Default)]
pub struct CoprotocolAbortHandle {
    aborted: Arc<AtomicBool>,
    bus: Arc<Mutex<Option<AbortHandle>>>,
}

impl CoprotocolAbortHandle {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        if let Some(bus) = self
            .bus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            bus.abort();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn attach(&self, bus: Option<AbortHandle>) {
        *self.bus.lock().unwrap_or_else(PoisonError::into_inner) = bus;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoprotocolError {
    #[error("coprotocol was used before start()")]
    NotStarted,
    #[error("coprotocol was already started")]
    AlreadyStarted,
    #[error("coprotocol is stopped or aborted")]
    Terminated,
    #[error("coprotocol deadline elapsed")]
    Timeout,
    #[error("coprotocol was aborted")]
    Cancelled,
    #[error(transparent)]
    Bus(BusError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl From<BusError> for CoprotocolError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout => CoprotocolError::Timeout,
            BusError::Cancelled => CoprotocolError::Cancelled,
            other => CoprotocolError::Bus(other),
        }
    }
}
