/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Lifecycle and bus bookkeeping shared by every coprotocol variant.

use std::{
    collections::BTreeSet,
    time::{Duration, Instant},
};

use crate::{
    bus::{Bus, BusError, BusFactory},
    context::Context,
    messages::envelope::Envelope,
    transport::{Inbound, MessageCrypto, Transport},
    types::pairwise::{Me, Their},
};

use super::{CoprotocolAbortHandle, CoprotocolError, CoprotocolState};

/// Upper bound on a single bus wait, so that a sticky abort which raced with the start of a wait is
/// noticed promptly.
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

type BusOf<C> = <<C as Context>::BusFactory as BusFactory>::Bus;

pub(crate) struct Coprotocol<C: Context> {
    context: C,
    transport: C::Transport,
    bus: Option<BusOf<C>>,
    state: CoprotocolState,
    time_to_live: Option<Duration>,
    die_time: Option<Instant>,
    binding_ids: BTreeSet<String>,
    please_ack_ids: BTreeSet<String>,
    abort: CoprotocolAbortHandle,
}

impl<C: Context> Coprotocol<C> {
    pub(crate) fn new(context: C, time_to_live: Option<Duration>) -> Self {
        Self {
            transport: context.transport(),
            context,
            bus: None,
            state: CoprotocolState::Idle,
            time_to_live,
            die_time: None,
            binding_ids: BTreeSet::new(),
            please_ack_ids: BTreeSet::new(),
            abort: CoprotocolAbortHandle::default(),
        }
    }

    pub(crate) fn context(&self) -> &C {
        &self.context
    }

    pub(crate) fn state(&self) -> CoprotocolState {
        self.state
    }

    pub(crate) fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    pub(crate) fn die_time(&self) -> Option<Instant> {
        self.die_time
    }

    pub(crate) fn binding_ids(&self) -> &BTreeSet<String> {
        &self.binding_ids
    }

    pub(crate) fn abort_handle(&self) -> CoprotocolAbortHandle {
        self.abort.clone()
    }

    pub(crate) fn ensure_running(&self) -> Result<(), CoprotocolError> {
        match self.state {
            CoprotocolState::Idle => Err(CoprotocolError::NotStarted),
            CoprotocolState::Running => Ok(()),
            CoprotocolState::Stopped | CoprotocolState::Aborted => Err(CoprotocolError::Terminated),
        }
    }

    /// Open a bus subscriber, fix the deadline, and register the ids returned by `subscribe`.
    pub(crate) fn start_with(
        &mut self,
        subscribe: impl FnOnce(&mut BusOf<C>) -> Result<Vec<String>, BusError>,
    ) -> Result<(), CoprotocolError> {
        match self.state {
            CoprotocolState::Idle => (),
            CoprotocolState::Running => return Err(CoprotocolError::AlreadyStarted),
            CoprotocolState::Stopped | CoprotocolState::Aborted => {
                return Err(CoprotocolError::Terminated)
            }
        }
        if self.abort.is_aborted() {
            self.state = CoprotocolState::Aborted;
            return Err(CoprotocolError::Cancelled);
        }

        let mut bus = self.context.bus_factory().open()?;
        self.abort.attach(Some(bus.abort_handle()));
        self.die_time = self.time_to_live.map(|ttl| Instant::now() + ttl);
        self.state = CoprotocolState::Running;

        let subscribed = subscribe(&mut bus);
        self.bus = Some(bus);
        match subscribed {
            Ok(ids) => {
                self.binding_ids.extend(ids);
                Ok(())
            }
            Err(err) => {
                self.stop();
                Err(err.into())
            }
        }
    }

    /// Subscribe to one more id on the running subscriber.
    pub(crate) fn bind(&mut self, id: &str) -> Result<(), CoprotocolError> {
        if self.binding_ids.contains(id) {
            return Ok(());
        }
        let bus = self.bus.as_mut().ok_or(CoprotocolError::NotStarted)?;
        bus.subscribe(id)?;
        self.binding_ids.insert(id.to_string());
        Ok(())
    }

    /// If `message` asks to be acknowledged, subscribe to the acknowledgement's thread id.
    pub(crate) fn watch_please_ack(&mut self, message: &Envelope) -> Result<(), CoprotocolError> {
        let Some(please_ack) = message.please_ack() else {
            return Ok(());
        };
        if self.binding_ids.contains(&please_ack.message_id)
            || self.please_ack_ids.contains(&please_ack.message_id)
        {
            return Ok(());
        }
        let bus = self.bus.as_mut().ok_or(CoprotocolError::NotStarted)?;
        bus.subscribe(&please_ack.message_id)?;
        self.please_ack_ids.insert(please_ack.message_id.clone());
        Ok(())
    }

    pub(crate) fn release_please_acks(&mut self) {
        if self.please_ack_ids.is_empty() {
            return;
        }
        let ids: Vec<String> = std::mem::take(&mut self.please_ack_ids).into_iter().collect();
        if let Some(bus) = self.bus.as_mut() {
            if let Err(err) = bus.unsubscribe_many(&ids) {
                log::warn!("failed to release {} ack subscription(s): {err}", ids.len());
            }
        }
    }

    pub(crate) fn pack(
        &self,
        message: &Envelope,
        me: &Me,
        their: &Their,
    ) -> Result<Vec<u8>, CoprotocolError> {
        Ok(self
            .context
            .crypto()
            .pack(message, &[their.verkey], Some(&me.verkey()))?)
    }

    /// Pack `message` for `their` and hand it to the transport.
    pub(crate) fn deliver(
        &mut self,
        message: &Envelope,
        me: &Me,
        their: &Their,
    ) -> Result<(), CoprotocolError> {
        self.ensure_running()?;
        self.watch_please_ack(message)?;
        let packed = self.pack(message, me, their)?;
        self.transport
            .send(packed, &their.endpoint, &their.routing_keys)?;
        log::trace!(
            "sent {} ({}) to {}",
            message.msg_type(),
            message.id(),
            their.did
        );
        Ok(())
    }

    /// Wait for the next event under an id this coprotocol owns, until its own deadline.
    pub(crate) fn get_one(&mut self) -> Result<Inbound, CoprotocolError> {
        self.get_one_until(self.die_time)
    }

    /// Wait for the next event under an id this coprotocol owns, until `deadline` (forever if `None`).
    ///
    /// The remaining time is recomputed on every iteration. Events under ids this coprotocol does not own
    /// and payloads that fail to unpack are logged and dropped.
    pub(crate) fn get_one_until(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Inbound, CoprotocolError> {
        self.ensure_running()?;
        loop {
            if self.abort.is_aborted() {
                return Err(CoprotocolError::Cancelled);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CoprotocolError::Timeout);
                    }
                    (deadline - now).min(ABORT_POLL_INTERVAL)
                }
                None => ABORT_POLL_INTERVAL,
            };

            let bus = self.bus.as_mut().ok_or(CoprotocolError::NotStarted)?;
            let event = match bus.next_event(Some(wait)) {
                Ok(event) => event,
                Err(BusError::Timeout) => continue,
                Err(err) => return Err(err.into()),
            };

            if !self.binding_ids.contains(&event.thread_id)
                && !self.please_ack_ids.contains(&event.thread_id)
            {
                log::debug!("discarding event for foreign id {}", event.thread_id);
                continue;
            }

            match self.context.crypto().unpack(&event.payload) {
                Ok(inbound) => return Ok(inbound),
                Err(err) => log::warn!("discarding undecodable event on {}: {err}", event.thread_id),
            }
        }
    }

    /// Release every owned subscription. Safe to call in any state, any number of times.
    pub(crate) fn stop(&mut self) {
        match self.state {
            CoprotocolState::Idle => {
                self.state = CoprotocolState::Stopped;
                return;
            }
            CoprotocolState::Stopped | CoprotocolState::Aborted => return,
            CoprotocolState::Running => (),
        }

        let ids: Vec<String> = std::mem::take(&mut self.binding_ids)
            .into_iter()
            .chain(std::mem::take(&mut self.please_ack_ids))
            .collect();
        if let Some(mut bus) = self.bus.take() {
            if let Err(err) = bus.unsubscribe_many(&ids) {
                log::warn!("failed to release {} subscription(s): {err}", ids.len());
            }
        }
        self.abort.attach(None);
        self.state = CoprotocolState::Stopped;
        log::debug!("coprotocol stopped, released {} subscription(s)", ids.len());
    }

    /// Wake any waiter, release every owned subscription, and refuse further use.
    pub(crate) fn abort(&mut self) {
        self.abort.abort();
        let terminal = matches!(
            self.state,
            CoprotocolState::Stopped | CoprotocolState::Aborted
        );
        self.stop();
        if !terminal {
            self.state = CoprotocolState::Aborted;
        }
    }
}

impl<C: Context> Drop for Coprotocol<C> {
    fn drop(&mut self) {
        self.stop()
    }
}
