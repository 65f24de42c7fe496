/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Coprotocols-rs is a Rust implementation of thread-scoped, time-bounded conversations between agents
//! (*coprotocols*), and of the ledger consensus protocols built on top of them. It offers:
//! 1. A publish/subscribe [bus] that routes every inbound message to the sessions interested in its
//!    thread, in-process or across a TCP connection,
//! 2. Four [coprotocol] variants for two-party, fan-out, and listening conversations, with absolute
//!    deadlines, duplicate suppression and cancellation,
//! 3. Pluggable message [transport] and encryption, bundled together with the bus in a [context],
//! 4. and a micro-ledger and three-phase commit [consensus] over any [ledger] implementation.

pub mod bus;

pub mod consensus;

pub mod context;

pub mod coprotocol;

pub mod event_dispatch;

pub mod events;

pub mod ledger;

pub mod logging;

pub mod messages;

pub mod transport;

pub mod types;
