/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Creation of a micro-ledger: a ledger shared by a small, fixed set of participants, whose genesis
//! transactions every participant signs before anyone commits them.
//!
//! The initiator creates the ledger with the genesis pending, and asks every other participant to do the
//! same through an [`InitializeRequest`]. Each acceptor checks that its own root hash matches and replies
//! with its signature. Once the initiator holds every signature, it sends them all in an
//! [`InitializeCommit`]; every acceptor verifies that the signer set is exactly the participant set,
//! acknowledges, and commits. The initiator commits once every acceptor acknowledged.
//!
//! A participant that aborts removes the ledger it created from its store.

use std::{sync::mpsc::Sender, time::SystemTime};

use crate::{
    context::Context,
    coprotocol::{
        theirs::TheirsCoprotocol, threaded::ThreadedCoprotocol, CoprotocolError, CoprotocolState,
        Inbound,
    },
    events::*,
    ledger::{merkle::merkle_root, Ledger, LedgerStore, Transaction},
    messages::{
        envelope::generate_id,
        notifications::{Ack, AckStatus, ProblemReport},
        TypedMessage,
    },
    types::{
        data_types::Did,
        pairwise::{Pairwise, Their},
    },
};

use super::{
    emit, find_peer,
    messages::{InitializeCommit, InitializeRequest, InitializeResponse, LedgerClaim},
    participant_set,
    state_machine::{
        expect_replies, expect_reply, Abort, ConsensusStatus, Interrupt, StateMachine,
        REQUEST_NOT_ACCEPTED, REQUEST_PROCESSING_ERROR, RESPONSE_NOT_ACCEPTED,
        RESPONSE_PROCESSING_ERROR,
    },
    ConsensusConfiguration, ConsensusError,
};

pub struct MicroledgerConsensus<C: Context> {
    context: C,
    config: ConsensusConfiguration,
    state: StateMachine,
    event_publisher: Option<Sender<Event>>,
}

impl<C: Context> MicroledgerConsensus<C> {
    pub fn new(context: C, config: ConsensusConfiguration) -> Self {
        Self {
            context,
            config,
            state: StateMachine::default(),
            event_publisher: None,
        }
    }

    pub fn with_event_publisher(mut self, event_publisher: Sender<Event>) -> Self {
        self.event_publisher = Some(event_publisher);
        self
    }

    pub fn config(&self) -> &ConsensusConfiguration {
        &self.config
    }

    pub fn status(&self) -> ConsensusStatus {
        self.state.status()
    }

    pub fn problem_report(&self) -> Option<&ProblemReport> {
        self.state.problem_report()
    }

    /// Create ledger `name` from `genesis` on every participant.
    ///
    /// Returns `(true, Some(ledger))` if every participant committed the genesis, and `(false, None)` if
    /// the round was aborted, in which case `name` is no longer in `store`.
    ///
    /// # Errors
    ///
    /// - If there are fewer than 2 participants, this participant is not one of them, or one of them is
    ///   missing from the directory.
    /// - If `store` already has a ledger named `name`.
    /// - If a local capability (ledger, crypto, bus) fails. The new ledger is removed first.
    pub fn init_microledger<S: LedgerStore>(
        &mut self,
        store: &mut S,
        name: &str,
        participants: &[Did],
        genesis: &[Transaction],
    ) -> Result<(bool, Option<S::Ledger>), ConsensusError> {
        let distinct = participant_set(participants).len();
        if distinct < 2 {
            return Err(ConsensusError::NotEnoughParticipants(distinct));
        }
        let peers = self.config.resolve_peers(participants)?;
        let mut ledger = store.create(name, genesis)?;
        self.state.begin();

        let mut coprotocol = TheirsCoprotocol::new(
            self.context.clone(),
            self.config.me.clone(),
            peers,
            generate_id(),
            Some(self.config.time_to_live),
        );
        let result = self.initiate(&mut coprotocol, &mut ledger, participants, genesis);
        let concluded = self.conclude(store, Some(name), result.map(|()| ledger), |report| {
            coprotocol.state() == CoprotocolState::Running
                && report
                    .to_envelope()
                    .ok()
                    .and_then(|envelope| coprotocol.send(envelope).ok())
                    .is_some_and(|deliveries| deliveries.values().any(|delivery| delivery.sent))
        });
        coprotocol.stop();
        concluded
    }

    fn initiate<L: Ledger>(
        &mut self,
        coprotocol: &mut TheirsCoprotocol<C>,
        ledger: &mut L,
        participants: &[Did],
        genesis: &[Transaction],
    ) -> Result<(), Interrupt> {
        coprotocol.start()?;

        let claim = LedgerClaim::new(ledger.name(), ledger.uncommitted_root_hash());
        let request = InitializeRequest {
            ledger: claim.ledger.clone(),
            genesis: genesis.to_vec(),
            root_hash: claim.root_hash,
            participants: participants.to_vec(),
            signature: claim.sign(&self.config.me.keypair)?,
        };
        emit(
            &self.config,
            &self.event_publisher,
            Event::Propose(ProposeEvent {
                timestamp: SystemTime::now(),
                ledger: claim.ledger.clone(),
                uncommitted_root_hash: claim.root_hash,
                participants: participants.to_vec(),
            }),
        );

        let outcomes = coprotocol.switch(request.to_envelope()?)?;
        let responses = expect_replies::<InitializeResponse>(
            outcomes,
            RESPONSE_PROCESSING_ERROR,
            RESPONSE_NOT_ACCEPTED,
        )?;
        let mut signatures = vec![request.signature];
        for (did, response) in responses {
            let their = find_peer(coprotocol.theirs(), &did)?;
            claim
                .verify_signed_by(&response.signature, &their.verkey)
                .map_err(|err| {
                    Abort::new(RESPONSE_NOT_ACCEPTED, format!("bad signature from {did}: {err}"))
                })?;
            signatures.push(response.signature);
        }

        let commit = InitializeCommit {
            ledger: claim.ledger.clone(),
            participants: participants.to_vec(),
            signatures,
        };
        let outcomes = coprotocol.switch(commit.to_envelope()?)?;
        let acks =
            expect_replies::<Ack>(outcomes, RESPONSE_PROCESSING_ERROR, RESPONSE_NOT_ACCEPTED)?;
        if let Some((did, ack)) = acks.iter().find(|(_, ack)| ack.status != AckStatus::Ok) {
            return Err(Abort::new(
                RESPONSE_NOT_ACCEPTED,
                format!("{did} acknowledged with status {:?}", ack.status),
            )
            .into());
        }

        let size = ledger.commit()?;

        // Everyone already committed; the closing ack only tells them the initiator did too.
        if let Ok(deliveries) = coprotocol.send(Ack::ok().to_envelope()?) {
            for (did, delivery) in deliveries.iter().filter(|(_, delivery)| !delivery.sent) {
                log::warn!(
                    "could not send the closing ack of {} to {did}: {}",
                    claim.ledger,
                    delivery.detail.as_deref().unwrap_or_default()
                );
            }
        }

        emit(
            &self.config,
            &self.event_publisher,
            Event::CommitLedger(CommitLedgerEvent {
                timestamp: SystemTime::now(),
                ledger: claim.ledger.clone(),
                root_hash: ledger.root_hash(),
                size,
            }),
        );
        emit(
            &self.config,
            &self.event_publisher,
            Event::CreateLedger(CreateLedgerEvent {
                timestamp: SystemTime::now(),
                ledger: claim.ledger,
                root_hash: ledger.root_hash(),
                participants: participants.to_vec(),
            }),
        );
        Ok(())
    }

    /// Take part in the creation opened by `inbound`, which must carry an [`InitializeRequest`].
    ///
    /// Returns `(true, Some(ledger))` if the new ledger was committed, and `(false, None)` if the round
    /// was aborted, in which case any ledger this call created is removed from `store` again. A ledger
    /// that existed before the call is never removed.
    ///
    /// # Errors
    ///
    /// If a local capability (ledger, crypto, bus) fails.
    pub fn accept_microledger<S: LedgerStore>(
        &mut self,
        store: &mut S,
        inbound: &Inbound,
    ) -> Result<(bool, Option<S::Ledger>), ConsensusError> {
        self.state.begin();

        let Some(initiator) = inbound
            .sender_verkey
            .as_ref()
            .and_then(|verkey| self.config.directory.find_by_verkey(verkey))
            .cloned()
        else {
            let abort = Abort::silent(REQUEST_NOT_ACCEPTED, "request from an unknown sender");
            return self.conclude(store, None, Err(abort.into()), |_| false);
        };

        let thid = inbound
            .message
            .thread_id()
            .unwrap_or(inbound.message.id())
            .to_string();
        let mut coprotocol = ThreadedCoprotocol::new(
            self.context.clone(),
            Pairwise::new(self.config.me.clone(), initiator.clone()),
            thid,
            Some(self.config.time_to_live),
        );
        let mut created = None;
        let result = self.accept(&mut coprotocol, store, &initiator, inbound, &mut created);
        let concluded = self.conclude(store, created.as_deref(), result, |report| {
            coprotocol.state() == CoprotocolState::Running
                && report
                    .to_envelope()
                    .ok()
                    .is_some_and(|envelope| coprotocol.send(envelope).is_ok())
        });
        coprotocol.stop();
        concluded
    }

    fn accept<S: LedgerStore>(
        &mut self,
        coprotocol: &mut ThreadedCoprotocol<C>,
        store: &mut S,
        initiator: &Their,
        inbound: &Inbound,
        created: &mut Option<String>,
    ) -> Result<S::Ledger, Interrupt> {
        coprotocol.start()?;

        let request = InitializeRequest::from_envelope(&inbound.message)
            .map_err(|err| Abort::new(REQUEST_NOT_ACCEPTED, err.to_string()))?;
        emit(
            &self.config,
            &self.event_publisher,
            Event::ReceiveProposal(ReceiveProposalEvent {
                timestamp: SystemTime::now(),
                origin: initiator.did.clone(),
                ledger: request.ledger.clone(),
                uncommitted_root_hash: request.root_hash,
            }),
        );

        let claim = LedgerClaim::new(request.ledger.clone(), request.root_hash);
        claim
            .verify_signed_by(&request.signature, &initiator.verkey)
            .map_err(|err| Abort::new(REQUEST_NOT_ACCEPTED, format!("bad request signature: {err}")))?;

        let participants = participant_set(&request.participants);
        if participants.len() < 2 {
            return Err(Abort::new(
                REQUEST_NOT_ACCEPTED,
                format!("a micro-ledger needs at least 2 participants, got {}", participants.len()),
            )
            .into());
        }
        if !participants.contains(&self.config.me.did) || !participants.contains(&initiator.did) {
            return Err(Abort::new(
                REQUEST_NOT_ACCEPTED,
                "initiator and acceptor must both be participants",
            )
            .into());
        }
        if store.exists(&request.ledger) {
            return Err(Abort::new(
                REQUEST_NOT_ACCEPTED,
                format!("ledger {} already exists", request.ledger),
            )
            .into());
        }

        let mut ledger = store.create(&request.ledger, &request.genesis)?;
        *created = Some(request.ledger.clone());
        let uncommitted_root_hash = ledger.uncommitted_root_hash();
        if uncommitted_root_hash != request.root_hash {
            return Err(Abort::new(
                REQUEST_PROCESSING_ERROR,
                format!(
                    "genesis root hash {uncommitted_root_hash} differs from the requested {}",
                    request.root_hash
                ),
            )
            .into());
        }

        let response = InitializeResponse {
            signature: claim.sign(&self.config.me.keypair)?,
        };
        emit(
            &self.config,
            &self.event_publisher,
            Event::PreCommit(PreCommitEvent {
                timestamp: SystemTime::now(),
                ledger: claim.ledger.clone(),
                uncommitted_root_hash,
            }),
        );

        let outcome = coprotocol.switch(response.to_envelope()?)?;
        let commit = expect_reply::<InitializeCommit>(
            &initiator.did,
            outcome,
            REQUEST_PROCESSING_ERROR,
            REQUEST_NOT_ACCEPTED,
        )?;
        if commit.ledger != claim.ledger {
            return Err(Abort::new(
                REQUEST_NOT_ACCEPTED,
                format!("commit is for ledger {}, not {}", commit.ledger, claim.ledger),
            )
            .into());
        }
        if participant_set(&commit.participants) != participants {
            return Err(Abort::new(
                REQUEST_NOT_ACCEPTED,
                "commit names a different participant set than the request",
            )
            .into());
        }

        let mut signers = Vec::with_capacity(commit.signatures.len());
        for signature in &commit.signatures {
            let verkey = claim
                .verify(signature)
                .map_err(|err| Abort::new(REQUEST_NOT_ACCEPTED, format!("bad signature: {err}")))?;
            let signer = self.config.did_of(&verkey).ok_or_else(|| {
                Abort::new(
                    REQUEST_NOT_ACCEPTED,
                    format!("signature by unknown key {}", signature.signer),
                )
            })?;
            signers.push(signer);
        }
        if signers.len() != participants.len() || participant_set(&signers) != participants {
            return Err(Abort::new(
                REQUEST_NOT_ACCEPTED,
                "signer set differs from the participant set",
            )
            .into());
        }

        match coprotocol.send(Ack::ok().to_envelope()?) {
            Ok(()) => (),
            Err(CoprotocolError::Transport(err)) => {
                return Err(Abort::silent(
                    REQUEST_PROCESSING_ERROR,
                    format!("could not acknowledge the commit: {err}"),
                )
                .into())
            }
            Err(err) => return Err(err.into()),
        }

        let size = ledger.commit()?;
        emit(
            &self.config,
            &self.event_publisher,
            Event::CommitLedger(CommitLedgerEvent {
                timestamp: SystemTime::now(),
                ledger: claim.ledger.clone(),
                root_hash: ledger.root_hash(),
                size,
            }),
        );
        emit(
            &self.config,
            &self.event_publisher,
            Event::CreateLedger(CreateLedgerEvent {
                timestamp: SystemTime::now(),
                ledger: claim.ledger,
                root_hash: ledger.root_hash(),
                participants: request.participants,
            }),
        );
        Ok(ledger)
    }

    /// End the round: record success, or remove the ledger named `created` from `store` and report the
    /// problem. `notify` delivers the problem report to the other participants and returns whether it did.
    fn conclude<S: LedgerStore>(
        &mut self,
        store: &mut S,
        created: Option<&str>,
        result: Result<S::Ledger, Interrupt>,
        notify: impl FnOnce(&ProblemReport) -> bool,
    ) -> Result<(bool, Option<S::Ledger>), ConsensusError> {
        let (report, notified, err) = match result {
            Ok(ledger) => {
                self.state.succeed();
                return Ok((true, Some(ledger)));
            }
            Err(Interrupt::Abort(abort)) => {
                let report = abort.report();
                let notified = abort.notify && notify(&report);
                (report, notified, None)
            }
            Err(Interrupt::Fatal(err)) => (
                ProblemReport::new(REQUEST_PROCESSING_ERROR, err.to_string()),
                false,
                Some(err),
            ),
        };

        let ledger = created.unwrap_or_default().to_string();
        if let Some(name) = created {
            store.reset(name);
            emit(
                &self.config,
                &self.event_publisher,
                Event::Rollback(RollbackEvent {
                    timestamp: SystemTime::now(),
                    ledger: ledger.clone(),
                    root_hash: merkle_root(std::iter::empty::<&Transaction>()),
                }),
            );
        }
        emit(
            &self.config,
            &self.event_publisher,
            Event::ProblemReport(ProblemReportEvent {
                timestamp: SystemTime::now(),
                ledger,
                problem_code: report.problem_code.clone(),
                explain: report.explain.clone(),
                notified,
            }),
        );
        self.state.fail(report);

        match err {
            Some(err) => Err(err),
            None => Ok((false, None)),
        }
    }
}
