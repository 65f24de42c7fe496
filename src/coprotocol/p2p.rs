/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Two-party coprotocol for a brand new conversation.
//!
//! No thread id is agreed on up front. The coprotocol subscribes by filter (the peer's key as sender, my
//! key as recipient, and the protocol names it speaks), and adopts a thread id from whichever happens
//! first: the first message it sends (whose `@id` becomes the thread id), or the first message it
//! receives.

use std::{collections::BTreeSet, time::Duration};

use crate::{
    bus::{Bus, Filter},
    context::Context,
    messages::envelope::{Envelope, Thread},
    types::pairwise::Pairwise,
};

use super::{
    base::Coprotocol, CoprotocolAbortHandle, CoprotocolError, CoprotocolState, Inbound, Outcome,
};

pub struct P2PCoprotocol<C: Context> {
    base: Coprotocol<C>,
    pairwise: Pairwise,
    protocols: Vec<String>,
    thid: Option<String>,
}

impl<C: Context> P2PCoprotocol<C> {
    pub fn new(
        context: C,
        pairwise: Pairwise,
        protocols: &[&str],
        time_to_live: Option<Duration>,
    ) -> Self {
        Self {
            base: Coprotocol::new(context, time_to_live),
            pairwise,
            protocols: protocols.iter().map(|protocol| protocol.to_string()).collect(),
            thid: None,
        }
    }

    /// The conversation's thread id, once one has been adopted.
    pub fn thread_id(&self) -> Option<&str> {
        self.thid.as_deref()
    }

    pub fn state(&self) -> CoprotocolState {
        self.base.state()
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.base.time_to_live()
    }

    /// The filter binding ids and the adopted thread id this coprotocol is subscribed to.
    pub fn subscriptions(&self) -> &BTreeSet<String> {
        self.base.binding_ids()
    }

    pub fn abort_handle(&self) -> CoprotocolAbortHandle {
        self.base.abort_handle()
    }

    pub fn start(&mut self) -> Result<(), CoprotocolError> {
        let filter = Filter {
            sender_keys: vec![self.pairwise.their.verkey],
            recipient_keys: vec![self.pairwise.me.verkey()],
            protocols: self.protocols.clone(),
        };
        self.base.start_with(|bus| {
            let (_, binding_ids) = bus.subscribe_by_filter(&filter)?;
            Ok(binding_ids)
        })
    }

    pub fn send(&mut self, mut message: Envelope) -> Result<(), CoprotocolError> {
        self.base.ensure_running()?;
        match &self.thid {
            Some(thid) if message.thread().is_none() => message.set_thread(Thread::new(thid))?,
            Some(_) => (),
            None => self.adopt(message.thread_id().unwrap_or(message.id()).to_string())?,
        }
        self.base
            .deliver(&message, &self.pairwise.me, &self.pairwise.their)
    }

    /// Wait for the next message from the peer. Once a thread id is adopted, anyone may publish on it, so
    /// messages from other senders are skipped.
    pub fn get_one(&mut self) -> Result<Inbound, CoprotocolError> {
        let inbound = loop {
            let inbound = self.base.get_one()?;
            if inbound.sender_verkey == Some(self.pairwise.their.verkey) {
                break inbound;
            }
            log::debug!(
                "p2p with {}: ignoring {} from an unexpected sender",
                self.pairwise.their.did,
                inbound.message.id()
            );
        };
        if self.thid.is_none() {
            let thid = inbound
                .message
                .thread_id()
                .unwrap_or(inbound.message.id())
                .to_string();
            self.adopt(thid)?;
        }
        Ok(inbound)
    }

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

    fn adopt(&mut self, thid: String) -> Result<(), CoprotocolError> {
        self.base.bind(&thid)?;
        self.thid = Some(thid);
        Ok(())
    }
}
