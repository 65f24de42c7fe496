/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events emitted by the consensus state machines, for event handling and logging.
//!
//! Note: an event for a given action indicates that the action has been completed.

use std::{sync::mpsc::Sender, time::SystemTime};

use crate::types::data_types::{CryptoHash, Did};

pub enum Event {
    // Events that change a ledger.
    CreateLedger(CreateLedgerEvent),
    CommitLedger(CommitLedgerEvent),
    Rollback(RollbackEvent),
    // Events that involve sending or receiving a consensus message.
    Propose(ProposeEvent),
    ReceiveProposal(ReceiveProposalEvent),
    PreCommit(PreCommitEvent),
    // Round failures.
    ProblemReport(ProblemReportEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // A dropped receiver only means nobody is interested anymore.
            let _ = event_publisher.send(event);
        }
    }
}

pub struct CreateLedgerEvent {
    pub timestamp: SystemTime,
    pub ledger: String,
    pub root_hash: CryptoHash,
    pub participants: Vec<Did>,
}

pub struct CommitLedgerEvent {
    pub timestamp: SystemTime,
    pub ledger: String,
    pub root_hash: CryptoHash,
    pub size: u64,
}

pub struct RollbackEvent {
    pub timestamp: SystemTime,
    pub ledger: String,
    /// The root hash the ledger was rolled back to.
    pub root_hash: CryptoHash,
}

pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub ledger: String,
    pub uncommitted_root_hash: CryptoHash,
    pub participants: Vec<Did>,
}

pub struct ReceiveProposalEvent {
    pub timestamp: SystemTime,
    pub origin: Did,
    pub ledger: String,
    pub uncommitted_root_hash: CryptoHash,
}

pub struct PreCommitEvent {
    pub timestamp: SystemTime,
    pub ledger: String,
    pub uncommitted_root_hash: CryptoHash,
}

pub struct ProblemReportEvent {
    pub timestamp: SystemTime,
    pub ledger: String,
    pub problem_code: String,
    pub explain: String,
    /// Whether the report was sent to the other participants.
    pub notified: bool,
}
