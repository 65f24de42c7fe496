/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-thread causal ordering bookkeeping.
//!
//! A threaded coprotocol stamps every message it sends with `~thread.sender_order`, which starts at 0 and
//! grows by exactly one per message, and with a copy of `received_orders`: the last order it observed
//! from each peer. A delivery whose `@id` repeats the last id seen from the same peer is a duplicate and
//! leaves `received_orders` untouched.

use std::collections::BTreeMap;

use crate::messages::envelope::{Envelope, EnvelopeError, Thread};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrderingState {
    next_order: u64,
    received_orders: BTreeMap<String, u64>,
    last_seen: BTreeMap<String, String>,
}

impl OrderingState {
    /// Number of messages stamped so far, which is also the order the next one will get.
    pub fn sender_order(&self) -> u64 {
        self.next_order
    }

    /// Last observed order per peer.
    pub fn received_orders(&self) -> &BTreeMap<String, u64> {
        &self.received_orders
    }

    /// Attach thread metadata to an outgoing message.
    ///
    /// Fields the caller already set on the message's `~thread` are kept as they are; only the missing
    /// ones are filled in.
    pub(crate) fn stamp(
        &mut self,
        message: &mut Envelope,
        thid: &str,
        pthid: Option<&str>,
    ) -> Result<(), EnvelopeError> {
        let order = self.next_order;
        let thread = match message.thread() {
            Some(existing) => {
                let mut thread = existing.clone();
                thread.sender_order.get_or_insert(order);
                if thread.received_orders.is_empty() {
                    thread.received_orders = self.received_orders.clone();
                }
                thread
            }
            None => Thread {
                thid: thid.to_string(),
                pthid: pthid.map(str::to_string),
                sender_order: Some(order),
                received_orders: self.received_orders.clone(),
            },
        };
        message.set_thread(thread)?;
        self.next_order += 1;
        Ok(())
    }

    /// Record `message` as received from `peer`. Returns `false` if it is a duplicate.
    pub(crate) fn observe(&mut self, peer: &str, message: &Envelope) -> bool {
        if self
            .last_seen
            .get(peer)
            .is_some_and(|last_id| last_id == message.id())
        {
            return false;
        }

        let order = message
            .thread()
            .and_then(|thread| thread.sender_order)
            .unwrap_or_else(|| self.received_orders.get(peer).map_or(0, |order| order + 1));
        self.received_orders.insert(peer.to_string(), order);
        self.last_seen
            .insert(peer.to_string(), message.id().to_string());
        true
    }
}

