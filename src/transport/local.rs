/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! An in-process [`Transport`] that delivers straight into each agent's [`InMemoryBus`] hub.
//!
//! Agents register their hub under an endpoint name. Sending to an endpoint unpacks the message (to learn
//! its thread id, protocol and keys) and routes it on the registered hub, exactly as an agent's mediator
//! would after receiving it off the wire. Sending to an endpoint that is not registered fails with
//! [`TransportError::Unreachable`], which makes "take an agent offline" a one-line operation in tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    bus::in_memory::{InMemoryBus, Routing},
    types::crypto_primitives::VerifyingKey,
};

use super::{MessageCrypto, Transport, TransportError};

#[derive(Clone)]
pub struct LocalNetwork<C: MessageCrypto> {
    hubs: Arc<Mutex<HashMap<String, InMemoryBus>>>,
    crypto: C,
}

impl<C: MessageCrypto> LocalNetwork<C> {
    pub fn new(crypto: C) -> Self {
        Self {
            hubs: Arc::new(Mutex::new(HashMap::new())),
            crypto,
        }
    }

    fn hubs(&self) -> MutexGuard<'_, HashMap<String, InMemoryBus>> {
        self.hubs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `hub` reachable at `endpoint`, replacing whatever was registered there.
    pub fn register(&self, endpoint: impl Into<String>, hub: InMemoryBus) {
        self.hubs().insert(endpoint.into(), hub);
    }

    /// Make `endpoint` unreachable. Returns the hub that was registered there, if any.
    pub fn unregister(&self, endpoint: &str) -> Option<InMemoryBus> {
        self.hubs().remove(endpoint)
    }
}

impl<C: MessageCrypto> Transport for LocalNetwork<C> {
    fn send(
        &mut self,
        packed: Vec<u8>,
        endpoint: &str,
        _routing_keys: &[VerifyingKey],
    ) -> Result<(), TransportError> {
        let hub = self
            .hubs()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(endpoint.to_string()))?;

        let inbound = self
            .crypto
            .unpack(&packed)
            .map_err(|err| TransportError::Rejected {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            })?;

        let routing = Routing {
            thread_id: inbound
                .message
                .thread_id()
                .unwrap_or(inbound.message.id())
                .to_string(),
            sender: inbound.sender_verkey,
            recipient: inbound.recipient_verkey,
            protocol: inbound.message.msg_type().protocol().to_string(),
        };

        if hub.route(&routing, packed) == 0 {
            log::debug!(
                "nobody at {} is listening for thread {}",
                endpoint,
                routing.thread_id
            );
        }
        Ok(())
    }
}
