/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The explicit session object handed to every coprotocol and consensus state machine.
//!
//! A [`Context`] bundles the three pluggable capabilities an agent needs to talk to its peers: a way to
//! open bus subscriptions, a way to pack messages, and a way to move packed messages. Nothing in the crate
//! looks these up from global state; whoever constructs a coprotocol passes the context in.

use typed_builder::TypedBuilder;

use crate::{
    bus::BusFactory,
    transport::{MessageCrypto, Transport},
};

pub trait Context: Clone + Send + 'static {
    type BusFactory: BusFactory;
    type Transport: Transport;
    type Crypto: MessageCrypto;

    fn bus_factory(&self) -> &Self::BusFactory;

    /// A transport handle owned by the caller. Transports are cheap to clone.
    fn transport(&self) -> Self::Transport;

    fn crypto(&self) -> &Self::Crypto;
}

/// The stock [`Context`]: a plain bundle of the three capabilities.
#[derive(Clone, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building an [AgentContext]. On the builder call the following methods to construct a valid [AgentContext].

    Required:
    - `.bus_factory(...)`
    - `.transport(...)`
    - `.crypto(...)`
"))]
pub struct AgentContext<F: BusFactory, T: Transport, C: MessageCrypto> {
    #[builder(setter(doc = "Set the factory that opens this agent's bus subscriptions. Required."))]
    bus_factory: F,
    #[builder(setter(doc = "Set the transport used to reach peers' endpoints. Required."))]
    transport: T,
    #[builder(setter(doc = "Set the message packer. Required."))]
    crypto: C,
}

impl<F: BusFactory, T: Transport, C: MessageCrypto> Context for AgentContext<F, T, C> {
    type BusFactory = F;
    type Transport = T;
    type Crypto = C;

    fn bus_factory(&self) -> &F {
        &self.bus_factory
    }

    fn transport(&self) -> T {
        self.transport.clone()
    }

    fn crypto(&self) -> &C {
        &self.crypto
    }
}
