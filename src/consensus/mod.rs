/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Consensus among a fixed set of participants over a replicated [ledger](crate::ledger), built on
//! [coprotocols](crate::coprotocol).
//!
//! Two state machines are provided:
//! 1. [`MicroledgerConsensus`](simple::MicroledgerConsensus) creates a new ledger from a genesis
//!    transaction set, committing it only once every participant signed the same root hash.
//! 2. [`BftConsensus`](bft::BftConsensus) appends transactions to an existing ledger through a
//!    propose, pre-commit, commit, post-commit exchange.
//!
//! In both, one participant drives the round (the *initiator* or *leader*) and the others answer (the
//! *acceptors*). Acceptors receive the message that opens a round through a
//! [`Listener`](crate::coprotocol::listener::Listener) and hand it to the matching `accept_*` method.
//!
//! A round that any participant rejects is rolled back everywhere it got to: every participant that
//! notices the problem rolls back its own ledger and, where the others may still be waiting, sends them a
//! [problem report](crate::messages::notifications::ProblemReport). Such rounds end in `Ok(false)`. `Err`
//! is reserved for misuse and for local failures.

pub mod bft;

pub mod messages;

pub mod simple;

pub mod state_machine;

use std::{collections::BTreeSet, sync::mpsc::Sender, time::Duration};

use typed_builder::TypedBuilder;

use crate::{
    coprotocol::CoprotocolError,
    events::Event,
    ledger::LedgerError,
    messages::envelope::EnvelopeError,
    types::{
        crypto_primitives::VerifyingKey,
        data_types::Did,
        pairwise::{Directory, Me, Their},
        signed_field::SignedFieldError,
    },
};

/// Stores the user-defined parameters required to run a consensus participant.
#[derive(Clone, Debug, TypedBuilder)]
pub struct ConsensusConfiguration {
    pub me: Me,
    /// Every peer this participant may run consensus with.
    pub directory: Directory,
    /// How long a round may take, counted from its start.
    #[builder(default = Duration::from_secs(10))]
    pub time_to_live: Duration,
    pub log_events: bool,
}

impl ConsensusConfiguration {
    /// Resolve `participants` into the peers to talk to. `participants` must include this participant,
    /// which is left out of the result. Repeated DIDs are resolved once.
    pub fn resolve_peers(&self, participants: &[Did]) -> Result<Vec<Their>, ConsensusError> {
        if !participants.contains(&self.me.did) {
            return Err(ConsensusError::NotAParticipant(self.me.did.clone()));
        }
        let mut seen = BTreeSet::new();
        let mut peers = Vec::new();
        for did in participants {
            if *did == self.me.did || !seen.insert(did) {
                continue;
            }
            match self.directory.get(did) {
                Some(their) => peers.push(their.clone()),
                None => return Err(ConsensusError::UnknownParticipant(did.clone())),
            }
        }
        Ok(peers)
    }

    /// The DID that owns `verkey`: this participant's, or a known peer's.
    pub fn did_of(&self, verkey: &VerifyingKey) -> Option<Did> {
        if *verkey == self.me.verkey() {
            Some(self.me.did.clone())
        } else {
            self.directory
                .find_by_verkey(verkey)
                .map(|their| their.did.clone())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("participant {0} is not in the directory")]
    UnknownParticipant(Did),
    #[error("{0} must be one of the participants")]
    NotAParticipant(Did),
    #[error("consensus needs at least 2 participants, got {0}")]
    NotEnoughParticipants(usize),
    #[error("a proposal needs at least one transaction")]
    NothingToPropose,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Coprotocol(#[from] CoprotocolError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Signing(#[from] SignedFieldError),
}

/// Log `event` if configured to, then hand it to the event publisher, if any.
pub(crate) fn emit(config: &ConsensusConfiguration, event_publisher: &Option<Sender<Event>>, event: Event) {
    if config.log_events {
        event.log();
    }
    Event::publish(event_publisher, event);
}

/// The distinct DIDs in `participants`.
pub(crate) fn participant_set(participants: &[Did]) -> BTreeSet<Did> {
    participants.iter().cloned().collect()
}

/// The peer with `did` among `theirs`.
pub(crate) fn find_peer<'a>(theirs: &'a [Their], did: &Did) -> Result<&'a Their, state_machine::Abort> {
    theirs.iter().find(|their| their.did == *did).ok_or_else(|| {
        state_machine::Abort::new(
            state_machine::RESPONSE_NOT_ACCEPTED,
            format!("{did} is not a participant"),
        )
    })
}
