/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Fan-out coprotocol: one initiator, many responders, one shared thread id.
//!
//! [`send`](TheirsCoprotocol::send) hands the same message to every peer's transport concurrently and
//! reports per-peer delivery instead of failing as a whole. [`switch`](TheirsCoprotocol::switch) then
//! waits, under the single shared deadline, for the first reply from each peer it reached, matching
//! replies to peers by sender key. In the map it returns:
//! - A peer that could not be reached maps to `ok: false` with a [`Transport`](OutcomeErrorKind::Transport)
//!   error. It is never waited for.
//! - A peer that replied maps to `ok: true` with its reply.
//! - A peer that was reached but did not reply in time maps to `ok: true`, no value, and a
//!   [`Timeout`](OutcomeErrorKind::Timeout) (or [`Cancelled`](OutcomeErrorKind::Cancelled)) error.

use std::{
    collections::BTreeMap,
    thread,
    time::{Duration, Instant},
};

use crate::{
    bus::Bus,
    context::Context,
    messages::envelope::Envelope,
    transport::Transport,
    types::{
        data_types::Did,
        pairwise::{Me, Their},
    },
};

use super::{
    base::Coprotocol, ordering::OrderingState, CoprotocolAbortHandle, CoprotocolError,
    CoprotocolState, Inbound, Outcome, OutcomeErrorKind,
};

/// Whether a message reached one peer's transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub sent: bool,
    pub detail: Option<String>,
}

impl Delivery {
    fn sent() -> Self {
        Self {
            sent: true,
            detail: None,
        }
    }

    fn failed(detail: impl Into<String>) -> Self {
        Self {
            sent: false,
            detail: Some(detail.into()),
        }
    }
}

pub struct TheirsCoprotocol<C: Context> {
    base: Coprotocol<C>,
    me: Me,
    theirs: Vec<Their>,
    thid: String,
    pthid: Option<String>,
    ordering: OrderingState,
}

impl<C: Context> TheirsCoprotocol<C> {
    pub fn new(
        context: C,
        me: Me,
        theirs: Vec<Their>,
        thid: impl Into<String>,
        time_to_live: Option<Duration>,
    ) -> Self {
        Self {
            base: Coprotocol::new(context, time_to_live),
            me,
            theirs,
            thid: thid.into(),
            pthid: None,
            ordering: OrderingState::default(),
        }
    }

    pub fn with_parent(mut self, pthid: impl Into<String>) -> Self {
        self.pthid = Some(pthid.into());
        self
    }

    pub fn thread_id(&self) -> &str {
        &self.thid
    }

    pub fn theirs(&self) -> &[Their] {
        &self.theirs
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

    pub fn die_time(&self) -> Option<Instant> {
        self.base.die_time()
    }

    pub fn abort_handle(&self) -> CoprotocolAbortHandle {
        self.base.abort_handle()
    }

    pub fn start(&mut self) -> Result<(), CoprotocolError> {
        let thid = self.thid.clone();
        self.base.start_with(|bus| {
            bus.subscribe(&thid)?;
            Ok(vec![thid])
        })
    }

    /// Send `message` to every peer concurrently.
    pub fn send(&mut self, mut message: Envelope) -> Result<BTreeMap<Did, Delivery>, CoprotocolError> {
        self.base.ensure_running()?;
        self.ordering
            .stamp(&mut message, &self.thid, self.pthid.as_deref())?;
        self.base.watch_please_ack(&message)?;

        let mut packed = Vec::with_capacity(self.theirs.len());
        for their in &self.theirs {
            packed.push((their, self.base.pack(&message, &self.me, their)?));
        }

        let base = &self.base;
        let deliveries = thread::scope(|scope| {
            let sends: Vec<_> = packed
                .into_iter()
                .map(|(their, bytes)| {
                    let mut transport = base.context().transport();
                    let send = scope.spawn(move || {
                        transport.send(bytes, &their.endpoint, &their.routing_keys)
                    });
                    (their, send)
                })
                .collect();

            sends
                .into_iter()
                .map(|(their, send)| {
                    let delivery = match send.join() {
                        Ok(Ok(())) => Delivery::sent(),
                        Ok(Err(err)) => Delivery::failed(err.to_string()),
                        Err(_) => Delivery::failed("transport panicked"),
                    };
                    (their.did.clone(), delivery)
                })
                .collect::<BTreeMap<_, _>>()
        });

        for (did, delivery) in &deliveries {
            if let Some(detail) = &delivery.detail {
                log::debug!("thread {}: could not reach {did}: {detail}", self.thid);
            }
        }
        Ok(deliveries)
    }

    /// Wait for the next message on this thread from any of the peers. Duplicate deliveries and messages
    /// from unknown senders are skipped.
    pub fn get_one(&mut self) -> Result<(Did, Inbound), CoprotocolError> {
        loop {
            let inbound = self.base.get_one()?;
            let Some(their) = self
                .theirs
                .iter()
                .find(|their| inbound.sender_verkey == Some(their.verkey))
            else {
                log::debug!(
                    "thread {}: ignoring {} from an unknown sender",
                    self.thid,
                    inbound.message.id()
                );
                continue;
            };
            if !self.ordering.observe(their.did.as_str(), &inbound.message) {
                log::trace!(
                    "thread {}: dropping duplicate delivery of {}",
                    self.thid,
                    inbound.message.id()
                );
                continue;
            }
            return Ok((their.did.clone(), inbound));
        }
    }

    /// Send `message` to every peer, then collect at most one reply from each peer that was reached.
    pub fn switch(
        &mut self,
        message: Envelope,
    ) -> Result<BTreeMap<Did, Outcome<Envelope>>, CoprotocolError> {
        let deliveries = match self.send(message) {
            Ok(deliveries) => deliveries,
            Err(err) => {
                self.base.release_please_acks();
                return Err(err);
            }
        };

        let mut outcomes = BTreeMap::new();
        let mut awaited = Vec::new();
        for (did, delivery) in deliveries {
            if delivery.sent {
                awaited.push(did);
            } else {
                let detail = delivery.detail.unwrap_or_default();
                outcomes.insert(did, Outcome::failure(OutcomeErrorKind::Transport, detail));
            }
        }

        let mut unanswered = OutcomeErrorKind::Timeout;
        while !awaited.is_empty() {
            match self.get_one() {
                Ok((did, inbound)) => match awaited.iter().position(|awaited| *awaited == did) {
                    Some(position) => {
                        awaited.swap_remove(position);
                        outcomes.insert(did, Outcome::success(inbound.message));
                    }
                    None => log::trace!("thread {}: not awaiting a reply from {did}", self.thid),
                },
                Err(CoprotocolError::Timeout) => break,
                Err(CoprotocolError::Cancelled) => {
                    unanswered = OutcomeErrorKind::Cancelled;
                    break;
                }
                Err(err) => {
                    self.base.release_please_acks();
                    return Err(err);
                }
            }
        }
        for did in awaited {
            outcomes.insert(did, Outcome::no_response(unanswered));
        }

        self.base.release_please_acks();
        Ok(outcomes)
    }

    pub fn stop(&mut self) {
        self.base.stop()
    }

    pub fn abort(&mut self) {
        self.base.abort()
    }
}
