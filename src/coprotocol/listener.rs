/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Long-lived subscription that receives the first message of conversations others start with me.
//!
//! Acceptors in the consensus protocols do not know a round's thread id until its first message arrives.
//! A [`Listener`] subscribes by filter (my key as recipient, one or more protocol names) and hands every
//! matching delivery to its owner, who then continues the conversation on a
//! [`ThreadedCoprotocol`](super::threaded::ThreadedCoprotocol).

use std::{
    collections::BTreeSet,
    time::{Duration, Instant},
};

use crate::{
    bus::{Bus, Filter},
    context::Context,
    types::pairwise::Me,
};

use super::{base::Coprotocol, CoprotocolAbortHandle, CoprotocolError, CoprotocolState, Inbound};

pub struct Listener<C: Context> {
    base: Coprotocol<C>,
}

impl<C: Context> Listener<C> {
    /// Start listening for messages addressed to `me` in any of `protocols`.
    pub fn start(context: C, me: &Me, protocols: &[&str]) -> Result<Listener<C>, CoprotocolError> {
        let filter = Filter {
            sender_keys: Vec::new(),
            recipient_keys: vec![me.verkey()],
            protocols: protocols.iter().map(|protocol| protocol.to_string()).collect(),
        };
        let mut base = Coprotocol::new(context, None);
        base.start_with(|bus| {
            let (_, binding_ids) = bus.subscribe_by_filter(&filter)?;
            Ok(binding_ids)
        })?;
        Ok(Listener { base })
    }

    pub fn state(&self) -> CoprotocolState {
        self.base.state()
    }

    pub fn abort_handle(&self) -> CoprotocolAbortHandle {
        self.base.abort_handle()
    }

    /// The filter binding ids this listener is subscribed to.
    pub fn subscriptions(&self) -> &BTreeSet<String> {
        self.base.binding_ids()
    }

    /// Wait at most `timeout` (forever if `None`) for the next message.
    pub fn next(&mut self, timeout: Option<Duration>) -> Result<Inbound, CoprotocolError> {
        self.base
            .get_one_until(timeout.map(|timeout| Instant::now() + timeout))
    }

    /// Wait at most `timeout` for the next message that satisfies `predicate`, dropping the others.
    pub fn next_where(
        &mut self,
        timeout: Option<Duration>,
        mut predicate: impl FnMut(&Inbound) -> bool,
    ) -> Result<Inbound, CoprotocolError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let inbound = self.base.get_one_until(deadline)?;
            if predicate(&inbound) {
                return Ok(inbound);
            }
            log::trace!(
                "listener skipping {} ({})",
                inbound.message.id(),
                inbound.message.msg_type()
            );
        }
    }

    pub fn stop(&mut self) {
        self.base.stop()
    }
}
