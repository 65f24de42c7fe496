/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Round bookkeeping shared by the consensus state machines.
//!
//! Each consensus type embeds a [`StateMachine`] that records whether a round is in progress and, if the
//! last round failed, the problem report that ended it. Inside a round, step functions return
//! `Result<_, Interrupt>`: an [`Interrupt::Abort`] ends the round with a rollback and a problem report,
//! while an [`Interrupt::Fatal`] is a local failure that is handed back to the caller after the rollback.

use crate::{
    coprotocol::{CoprotocolError, Outcome},
    ledger::LedgerError,
    messages::{
        envelope::{Envelope, EnvelopeError},
        notifications::ProblemReport,
        TypedMessage,
    },
    types::{data_types::Did, signed_field::SignedFieldError},
};

use super::ConsensusError;

/// The participant cannot accept the request it received.
pub const REQUEST_NOT_ACCEPTED: &str = "request_not_accepted";
/// The participant accepted the request but failed to carry it out.
pub const REQUEST_PROCESSING_ERROR: &str = "request_processing_error";
/// The round's driver rejected a reply.
pub const RESPONSE_NOT_ACCEPTED: &str = "response_not_accepted";
/// The round's driver did not get every reply it needed.
pub const RESPONSE_PROCESSING_ERROR: &str = "response_processing_error";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConsensusStatus {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Default)]
pub struct StateMachine {
    status: ConsensusStatus,
    problem_report: Option<ProblemReport>,
}

impl StateMachine {
    pub fn status(&self) -> ConsensusStatus {
        self.status
    }

    /// The problem report of the last round, if it failed.
    pub fn problem_report(&self) -> Option<&ProblemReport> {
        self.problem_report.as_ref()
    }

    pub(crate) fn begin(&mut self) {
        self.status = ConsensusStatus::Running;
        self.problem_report = None;
    }

    pub(crate) fn succeed(&mut self) {
        self.status = ConsensusStatus::Succeeded;
    }

    pub(crate) fn fail(&mut self, problem_report: ProblemReport) {
        self.status = ConsensusStatus::Failed;
        self.problem_report = Some(problem_report);
    }
}

/// A reason to end the round early.
#[derive(Debug)]
pub(crate) struct Abort {
    pub(crate) problem_code: &'static str,
    pub(crate) explain: String,
    /// Whether the other participants should be sent a problem report.
    pub(crate) notify: bool,
}

impl Abort {
    pub(crate) fn new(problem_code: &'static str, explain: impl Into<String>) -> Self {
        Self {
            problem_code,
            explain: explain.into(),
            notify: true,
        }
    }

    /// Abort without telling the other participants, e.g., because they are the ones who gave up.
    pub(crate) fn silent(problem_code: &'static str, explain: impl Into<String>) -> Self {
        Self {
            notify: false,
            ..Self::new(problem_code, explain)
        }
    }

    pub(crate) fn report(&self) -> ProblemReport {
        ProblemReport::new(self.problem_code, self.explain.clone())
    }
}

pub(crate) enum Interrupt {
    Abort(Abort),
    Fatal(ConsensusError),
}

impl From<Abort> for Interrupt {
    fn from(abort: Abort) -> Self {
        Interrupt::Abort(abort)
    }
}

impl From<ConsensusError> for Interrupt {
    fn from(err: ConsensusError) -> Self {
        Interrupt::Fatal(err)
    }
}

impl From<CoprotocolError> for Interrupt {
    fn from(err: CoprotocolError) -> Self {
        Interrupt::Fatal(err.into())
    }
}

impl From<LedgerError> for Interrupt {
    fn from(err: LedgerError) -> Self {
        Interrupt::Fatal(err.into())
    }
}

impl From<EnvelopeError> for Interrupt {
    fn from(err: EnvelopeError) -> Self {
        Interrupt::Fatal(err.into())
    }
}

impl From<SignedFieldError> for Interrupt {
    fn from(err: SignedFieldError) -> Self {
        Interrupt::Fatal(err.into())
    }
}

/// Read a reply of type `M` out of `outcome`.
///
/// A missing reply aborts with `missing_code`. A problem report from `peer` aborts silently, and any
/// other message aborts with `rejected_code`.
pub(crate) fn expect_reply<M: TypedMessage>(
    peer: &Did,
    outcome: Outcome<Envelope>,
    missing_code: &'static str,
    rejected_code: &'static str,
) -> Result<M, Abort> {
    let Some(reply) = outcome.value else {
        let detail = outcome
            .error
            .map(|error| error.detail)
            .unwrap_or_default();
        return Err(Abort::new(
            missing_code,
            format!("no {} from {peer}: {detail}", M::NAME),
        ));
    };

    if ProblemReport::matches(&reply) {
        let explain = match ProblemReport::from_envelope(&reply) {
            Ok(report) => format!("{peer} reported {}: {}", report.problem_code, report.explain),
            Err(_) => format!("{peer} sent a malformed problem report"),
        };
        return Err(Abort::silent(rejected_code, explain));
    }

    M::from_envelope(&reply).map_err(|err| {
        Abort::new(
            rejected_code,
            format!("{peer} replied with {} instead of {}: {err}", reply.msg_type(), M::NAME),
        )
    })
}

/// Read one reply of type `M` from every peer in `outcomes`, in DID order.
///
/// Unlike [`expect_reply`], a problem report from one peer still notifies the rest, which are waiting
/// for the next step of the round.
pub(crate) fn expect_replies<M: TypedMessage>(
    outcomes: impl IntoIterator<Item = (Did, Outcome<Envelope>)>,
    missing_code: &'static str,
    rejected_code: &'static str,
) -> Result<Vec<(Did, M)>, Abort> {
    let mut replies = Vec::new();
    let mut missing = Vec::new();
    for (peer, outcome) in outcomes {
        if outcome.value.is_none() {
            missing.push(peer);
            continue;
        }
        match expect_reply::<M>(&peer, outcome, missing_code, rejected_code) {
            Ok(reply) => replies.push((peer, reply)),
            Err(abort) => {
                return Err(Abort {
                    notify: true,
                    ..abort
                })
            }
        }
    }

    if !missing.is_empty() {
        let missing: Vec<&str> = missing.iter().map(Did::as_str).collect();
        return Err(Abort::new(
            missing_code,
            format!("no {} from {}", M::NAME, missing.join(", ")),
        ));
    }
    Ok(replies)
}
