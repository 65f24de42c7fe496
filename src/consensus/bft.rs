/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Three-phase commit of new transactions to an existing ledger.
//!
//! ## Leader
//!
//! [`propose_and_commit`](BftConsensus::propose_and_commit):
//! 1. Appends the transactions to its ledger and signs the resulting uncommitted root hash.
//! 2. Sends a [`StagePropose`] to every other participant and waits for a [`StagePreCommit`] from each.
//!    Every pre-commit must be signed by the expected participant over the same root hash.
//! 3. Sends a [`StageCommit`] carrying all the pre-commits and waits for a [`StagePostCommit`] from each.
//! 4. Commits.
//!
//! ## Acceptor
//!
//! [`accept_commit`](BftConsensus::accept_commit), given the [`StagePropose`]:
//! 1. Checks the leader's signature and that the proposal is not empty, appends the transactions, and
//!    requires its own uncommitted root hash to equal the proposed one.
//! 2. Replies with its signed [`StagePreCommit`] and waits for the [`StageCommit`].
//! 3. Checks that the commit carries exactly one valid pre-commit per acceptor over the proposed root.
//! 4. Replies with a [`StagePostCommit`] and commits.
//!
//! Any failed check rolls the ledger back to its last committed state.

use std::{collections::BTreeSet, sync::mpsc::Sender, time::SystemTime};

use crate::{
    context::Context,
    coprotocol::{
        theirs::TheirsCoprotocol, threaded::ThreadedCoprotocol, CoprotocolError, CoprotocolState,
        Inbound,
    },
    events::*,
    ledger::{Ledger, Transaction},
    messages::{envelope::generate_id, notifications::ProblemReport, TypedMessage},
    types::{
        data_types::Did,
        pairwise::{Pairwise, Their},
    },
};

use super::{
    emit, find_peer,
    messages::{LedgerClaim, StageCommit, StagePostCommit, StagePreCommit, StagePropose},
    participant_set,
    state_machine::{
        expect_replies, expect_reply, Abort, ConsensusStatus, Interrupt, StateMachine,
        REQUEST_NOT_ACCEPTED, REQUEST_PROCESSING_ERROR, RESPONSE_NOT_ACCEPTED,
        RESPONSE_PROCESSING_ERROR,
    },
    ConsensusConfiguration, ConsensusError,
};

pub struct BftConsensus<C: Context> {
    context: C,
    config: ConsensusConfiguration,
    state: StateMachine,
    event_publisher: Option<Sender<Event>>,
}

impl<C: Context> BftConsensus<C> {
    pub fn new(context: C, config: ConsensusConfiguration) -> Self {
        Self {
            context,
            config,
            state: StateMachine::default(),
            event_publisher: None,
        }
    }

    /// Publish every [event](crate::events) of this participant on `event_publisher`.
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

    /// Why the last round failed, if it did.
    pub fn problem_report(&self) -> Option<&ProblemReport> {
        self.state.problem_report()
    }

    /// Commit `txns` to `ledger` on every participant.
    ///
    /// Returns `Ok(true)` if every participant committed, and `Ok(false)` if the round was rolled back.
    ///
    /// # Errors
    ///
    /// - If `txns` is empty.
    /// - If `participants` does not include this participant, or names a DID missing from the directory.
    /// - If a local capability (ledger, crypto, bus) fails. The ledger is rolled back first.
    pub fn propose_and_commit<L: Ledger>(
        &mut self,
        ledger: &mut L,
        participants: &[Did],
        txns: &[Transaction],
    ) -> Result<bool, ConsensusError> {
        if txns.is_empty() {
            return Err(ConsensusError::NothingToPropose);
        }
        let peers = self.config.resolve_peers(participants)?;
        self.state.begin();

        let mut coprotocol = TheirsCoprotocol::new(
            self.context.clone(),
            self.config.me.clone(),
            peers,
            generate_id(),
            Some(self.config.time_to_live),
        );
        let result = self.lead(&mut coprotocol, ledger, participants, txns);
        let concluded = self.conclude(ledger, result, |report| {
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

    fn lead<L: Ledger>(
        &mut self,
        coprotocol: &mut TheirsCoprotocol<C>,
        ledger: &mut L,
        participants: &[Did],
        txns: &[Transaction],
    ) -> Result<(), Interrupt> {
        coprotocol.start()?;
        ledger.add_transactions(txns)?;

        let claim = LedgerClaim::new(ledger.name(), ledger.uncommitted_root_hash());
        let propose = StagePropose {
            ledger: claim.ledger.clone(),
            transactions: txns.to_vec(),
            uncommitted_root_hash: claim.root_hash,
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

        let outcomes = coprotocol.switch(propose.to_envelope()?)?;
        let pre_commits = expect_replies::<StagePreCommit>(
            outcomes,
            RESPONSE_PROCESSING_ERROR,
            RESPONSE_NOT_ACCEPTED,
        )?;
        let mut signatures = Vec::with_capacity(pre_commits.len());
        for (did, pre_commit) in pre_commits {
            let their = find_peer(coprotocol.theirs(), &did)?;
            claim
                .verify_signed_by(&pre_commit.signature, &their.verkey)
                .map_err(|err| {
                    Abort::new(RESPONSE_NOT_ACCEPTED, format!("bad pre-commit from {did}: {err}"))
                })?;
            signatures.push(pre_commit.signature);
        }

        let commit = StageCommit {
            pre_commits: signatures,
        };
        let outcomes = coprotocol.switch(commit.to_envelope()?)?;
        let post_commits = expect_replies::<StagePostCommit>(
            outcomes,
            RESPONSE_PROCESSING_ERROR,
            RESPONSE_NOT_ACCEPTED,
        )?;
        for (did, post_commit) in post_commits {
            let their = find_peer(coprotocol.theirs(), &did)?;
            claim
                .verify_signed_by(&post_commit.signature, &their.verkey)
                .map_err(|err| {
                    Abort::new(RESPONSE_NOT_ACCEPTED, format!("bad post-commit from {did}: {err}"))
                })?;
        }

        let size = ledger.commit()?;
        emit(
            &self.config,
            &self.event_publisher,
            Event::CommitLedger(CommitLedgerEvent {
                timestamp: SystemTime::now(),
                ledger: claim.ledger,
                root_hash: ledger.root_hash(),
                size,
            }),
        );
        Ok(())
    }

    /// Take part in the round opened by `inbound`, which must carry a [`StagePropose`].
    ///
    /// Returns `Ok(true)` if `ledger` committed the proposed transactions, and `Ok(false)` if the round
    /// was rolled back.
    ///
    /// # Errors
    ///
    /// If a local capability (ledger, crypto, bus) fails. The ledger is rolled back first.
    pub fn accept_commit<L: Ledger>(
        &mut self,
        ledger: &mut L,
        inbound: &Inbound,
    ) -> Result<bool, ConsensusError> {
        self.state.begin();

        let Some(leader) = inbound
            .sender_verkey
            .as_ref()
            .and_then(|verkey| self.config.directory.find_by_verkey(verkey))
            .cloned()
        else {
            let abort = Abort::silent(REQUEST_NOT_ACCEPTED, "proposal from an unknown sender");
            return self.conclude(ledger, Err(abort.into()), |_| false);
        };

        let thid = inbound
            .message
            .thread_id()
            .unwrap_or(inbound.message.id())
            .to_string();
        let mut coprotocol = ThreadedCoprotocol::new(
            self.context.clone(),
            Pairwise::new(self.config.me.clone(), leader.clone()),
            thid,
            Some(self.config.time_to_live),
        );
        let result = self.accept(&mut coprotocol, ledger, &leader, inbound);
        let concluded = self.conclude(ledger, result, |report| {
            coprotocol.state() == CoprotocolState::Running
                && report
                    .to_envelope()
                    .ok()
                    .is_some_and(|envelope| coprotocol.send(envelope).is_ok())
        });
        coprotocol.stop();
        concluded
    }

    fn accept<L: Ledger>(
        &mut self,
        coprotocol: &mut ThreadedCoprotocol<C>,
        ledger: &mut L,
        leader: &Their,
        inbound: &Inbound,
    ) -> Result<(), Interrupt> {
        coprotocol.start()?;

        let propose = StagePropose::from_envelope(&inbound.message)
            .map_err(|err| Abort::new(REQUEST_NOT_ACCEPTED, err.to_string()))?;
        emit(
            &self.config,
            &self.event_publisher,
            Event::ReceiveProposal(ReceiveProposalEvent {
                timestamp: SystemTime::now(),
                origin: leader.did.clone(),
                ledger: propose.ledger.clone(),
                uncommitted_root_hash: propose.uncommitted_root_hash,
            }),
        );

        let claim = LedgerClaim::new(propose.ledger.clone(), propose.uncommitted_root_hash);
        claim
            .verify_signed_by(&propose.signature, &leader.verkey)
            .map_err(|err| Abort::new(REQUEST_NOT_ACCEPTED, format!("bad proposal signature: {err}")))?;
        if propose.transactions.is_empty() {
            return Err(Abort::new(REQUEST_NOT_ACCEPTED, "proposal carries no transactions").into());
        }
        if propose.ledger != ledger.name() {
            return Err(Abort::new(
                REQUEST_NOT_ACCEPTED,
                format!("proposal is for ledger {}, not {}", propose.ledger, ledger.name()),
            )
            .into());
        }

        let participants = participant_set(&propose.participants);
        if !participants.contains(&self.config.me.did) || !participants.contains(&leader.did) {
            return Err(Abort::new(
                REQUEST_NOT_ACCEPTED,
                "leader and acceptor must both be participants",
            )
            .into());
        }
        let mut acceptors = participants;
        acceptors.remove(&leader.did);
        if let Some(unknown) = acceptors
            .iter()
            .find(|did| **did != self.config.me.did && self.config.directory.get(did).is_none())
        {
            return Err(Abort::new(
                REQUEST_NOT_ACCEPTED,
                format!("participant {unknown} is not in the directory"),
            )
            .into());
        }

        ledger.add_transactions(&propose.transactions)?;
        let uncommitted_root_hash = ledger.uncommitted_root_hash();
        if uncommitted_root_hash != propose.uncommitted_root_hash {
            return Err(Abort::new(
                REQUEST_PROCESSING_ERROR,
                format!(
                    "uncommitted root hash {uncommitted_root_hash} differs from the proposed {}",
                    propose.uncommitted_root_hash
                ),
            )
            .into());
        }

        let pre_commit = StagePreCommit {
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

        let outcome = coprotocol.switch(pre_commit.to_envelope()?)?;
        let commit = expect_reply::<StageCommit>(
            &leader.did,
            outcome,
            REQUEST_PROCESSING_ERROR,
            REQUEST_NOT_ACCEPTED,
        )?;
        self.check_pre_commits(&claim, &commit, &acceptors)?;

        let post_commit = StagePostCommit {
            signature: claim.sign(&self.config.me.keypair)?,
        };
        match coprotocol.send(post_commit.to_envelope()?) {
            Ok(()) => (),
            Err(CoprotocolError::Transport(err)) => {
                return Err(Abort::silent(
                    REQUEST_PROCESSING_ERROR,
                    format!("could not send post-commit: {err}"),
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
                ledger: claim.ledger,
                root_hash: ledger.root_hash(),
                size,
            }),
        );
        Ok(())
    }

    /// Require `commit` to carry exactly one valid pre-commit over `claim` from each of `acceptors`.
    fn check_pre_commits(
        &self,
        claim: &LedgerClaim,
        commit: &StageCommit,
        acceptors: &BTreeSet<Did>,
    ) -> Result<(), Abort> {
        let mut signers = BTreeSet::new();
        for pre_commit in &commit.pre_commits {
            let verkey = claim
                .verify(pre_commit)
                .map_err(|err| Abort::new(REQUEST_NOT_ACCEPTED, format!("bad pre-commit: {err}")))?;
            let signer = self.config.did_of(&verkey).ok_or_else(|| {
                Abort::new(
                    REQUEST_NOT_ACCEPTED,
                    format!("pre-commit signed by unknown key {}", pre_commit.signer),
                )
            })?;
            if !signers.insert(signer.clone()) {
                return Err(Abort::new(
                    REQUEST_NOT_ACCEPTED,
                    format!("{signer} pre-committed twice"),
                ));
            }
        }
        if signers != *acceptors {
            return Err(Abort::new(
                REQUEST_NOT_ACCEPTED,
                format!(
                    "commit carries pre-commits from {} participants, expected {}",
                    signers.len(),
                    acceptors.len()
                ),
            ));
        }
        Ok(())
    }

    /// End the round: record success, or roll `ledger` back and report the problem. `notify` delivers the
    /// problem report to the other participants and returns whether it did.
    fn conclude<L: Ledger>(
        &mut self,
        ledger: &mut L,
        result: Result<(), Interrupt>,
        notify: impl FnOnce(&ProblemReport) -> bool,
    ) -> Result<bool, ConsensusError> {
        let (report, notified, err) = match result {
            Ok(()) => {
                self.state.succeed();
                return Ok(true);
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

        ledger.reset_uncommitted();
        emit(
            &self.config,
            &self.event_publisher,
            Event::Rollback(RollbackEvent {
                timestamp: SystemTime::now(),
                ledger: ledger.name(),
                root_hash: ledger.root_hash(),
            }),
        );
        emit(
            &self.config,
            &self.event_publisher,
            Event::ProblemReport(ProblemReportEvent {
                timestamp: SystemTime::now(),
                ledger: ledger.name(),
                problem_code: report.problem_code.clone(),
                explain: report.explain.clone(),
                notified,
            }),
        );
        self.state.fail(report);

        match err {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }
}
