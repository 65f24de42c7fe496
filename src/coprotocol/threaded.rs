/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Two-party coprotocol on a pre-agreed thread id.

use std::time::{Duration, Instant};

use crate::{
    bus::Bus,
    context::Context,
    messages::envelope::Envelope,
    types::pairwise::Pairwise,
};

use super::{
    base::Coprotocol, ordering::OrderingState, CoprotocolAbortHandle, CoprotocolError,
    CoprotocolState, Inbound, Outcome,
};

pub struct ThreadedCoprotocol<C: Context> {
    base: Coprotocol<C>,
    pairwise: Pairwise,
    thid: String,
    pthid: Option<String>,
    ordering: OrderingState,
}

impl<C: Context> ThreadedCoprotocol<C> {
    /// Create an idle coprotocol with `pairwise.their` on thread `thid`. `time_to_live` of `None` means
    /// waits are unbounded.
    pub fn new(
        context: C,
        pairwise: Pairwise,
        thid: impl Into<String>,
        time_to_live: Option<Duration>,
    ) -> Self {
        Self {
            base: Coprotocol::new(context, time_to_live),
            pairwise,
            thid: thid.into(),
            pthid: None,
            ordering: OrderingState::default(),
        }
    }

    /// Nest this conversation under the parent thread `pthid`.
    pub fn with_parent(mut self, pthid: impl Into<String>) -> Self {
        self.pthid = Some(pthid.into());
        self
    }

    pub fn thread_id(&self) -> &str {
        &self.thid
    }

    pub fn pairwise(&self) -> &Pairwise {
        &self.pairwise
    }

    pub fn state(&self) -> CoprotocolState {
        self.base.state()
    }

    pub fn ordering(&self) -> &OrderingState {
        &self.ordering
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.base.time_to_live()
    }

    /// The absolute deadline, fixed by [`start`](Self::start).
    pub fn die_time(&self) -> Option<Instant> {
        self.base.die_time()
    }

    pub fn abort_handle(&self) -> CoprotocolAbortHandle {
        self.base.abort_handle()
    }

    /// Subscribe to the thread id and fix the deadline.
    pub fn start(&mut self) -> Result<(), CoprotocolError> {
        let thid = self.thid.clone();
        self.base.start_with(|bus| {
            bus.subscribe(&thid)?;
            Ok(vec![thid])
        })
    }

    /// Stamp `message` with this thread's metadata and send it to the peer. If the message asks for an
    /// acknowledgement, the acknowledgement's thread is subscribed to as well.
    pub fn send(&mut self, mut message: Envelope) -> Result<(), CoprotocolError> {
        self.base.ensure_running()?;
        self.ordering
            .stamp(&mut message, &self.thid, self.pthid.as_deref())?;
        self.base
            .deliver(&message, &self.pairwise.me, &self.pairwise.their)
    }

    /// Wait for the next message from the peer on this thread. Duplicate deliveries and messages from
    /// other senders are skipped.
    pub fn get_one(&mut self) -> Result<Inbound, CoprotocolError> {
        loop {
            let inbound = self.base.get_one()?;
            if inbound.sender_verkey != Some(self.pairwise.their.verkey) {
                log::debug!(
                    "thread {}: ignoring {} from an unexpected sender",
                    self.thid,
                    inbound.message.id()
                );
                continue;
            }
            if !self
                .ordering
                .observe(self.pairwise.their.did.as_str(), &inbound.message)
            {
                log::trace!(
                    "thread {}: dropping duplicate delivery of {}",
                    self.thid,
                    inbound.message.id()
                );
                continue;
            }
            return Ok(inbound);
        }
    }

    /// Send `message` and wait for exactly one reply.
    pub fn switch(&mut self, message: Envelope) -> Result<Outcome<Envelope>, CoprotocolError> {
        let received = self.send(message).and_then(|()| self.get_one());
        self.base.release_please_acks();
        match received {
            Ok(inbound) => Ok(Outcome::success(inbound.message)),
            Err(err) => Outcome::absorb(err),
        }
    }

    pub fn stop(&mut self) {
        self.base.stop()
    }

    pub fn abort(&mut self) {
        self.base.abort()
    }
}
