/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the consensus
//! [configuration](crate::consensus::ConsensusConfiguration), or registered the default loggers on an
//! [`EventHandlers`](crate::event_dispatch::EventHandlers).
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceiveProposal](crate::events::ReceiveProposalEvent) is printed:
//!
//! ```text
//! ReceiveProposal, 1701329264, did:peer:leader, orders, fNGCJyk
//! ```
//!
//! In the snippet:
//! - The third value is the DID of the origin of the proposal.
//! - The fourth value is the name of the ledger.
//! - The fifth value is the first seven characters of the Base64 encoding of the proposed uncommitted
//!   root hash.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const CREATE_LEDGER: &str = "CreateLedger";
pub const COMMIT_LEDGER: &str = "CommitLedger";
pub const ROLLBACK: &str = "Rollback";

pub const PROPOSE: &str = "Propose";
pub const RECEIVE_PROPOSAL: &str = "ReceiveProposal";
pub const PRE_COMMIT: &str = "PreCommit";

pub const PROBLEM_REPORT: &str = "ProblemReport";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for CreateLedgerEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |create_ledger_event: &CreateLedgerEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                CREATE_LEDGER,
                secs_since_unix_epoch(create_ledger_event.timestamp),
                create_ledger_event.ledger,
                first_seven_base64_chars(&create_ledger_event.root_hash.bytes()),
                create_ledger_event.participants.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitLedgerEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_ledger_event: &CommitLedgerEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT_LEDGER,
                secs_since_unix_epoch(commit_ledger_event.timestamp),
                commit_ledger_event.ledger,
                first_seven_base64_chars(&commit_ledger_event.root_hash.bytes()),
                commit_ledger_event.size
            )
        };
        Box::new(logger)
    }
}

impl Logger for RollbackEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |rollback_event: &RollbackEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ROLLBACK,
                secs_since_unix_epoch(rollback_event.timestamp),
                rollback_event.ledger,
                first_seven_base64_chars(&rollback_event.root_hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(propose_event.timestamp),
                propose_event.ledger,
                first_seven_base64_chars(&propose_event.uncommitted_root_hash.bytes()),
                propose_event.participants.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_proposal_event: &ReceiveProposalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_PROPOSAL,
                secs_since_unix_epoch(receive_proposal_event.timestamp),
                receive_proposal_event.origin,
                receive_proposal_event.ledger,
                first_seven_base64_chars(&receive_proposal_event.uncommitted_root_hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for PreCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |pre_commit_event: &PreCommitEvent| {
            log::info!(
                "{}, {}, {}, {}",
                PRE_COMMIT,
                secs_since_unix_epoch(pre_commit_event.timestamp),
                pre_commit_event.ledger,
                first_seven_base64_chars(&pre_commit_event.uncommitted_root_hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProblemReportEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |problem_report_event: &ProblemReportEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}, {}",
                PROBLEM_REPORT,
                secs_since_unix_epoch(problem_report_event.timestamp),
                problem_report_event.ledger,
                problem_report_event.problem_code,
                problem_report_event.notified,
                problem_report_event.explain
            )
        };
        Box::new(logger)
    }
}

impl Event {
    /// Log this event with its default logger.
    pub(crate) fn log(&self) {
        match self {
            Event::CreateLedger(event) => CreateLedgerEvent::get_logger()(event),
            Event::CommitLedger(event) => CommitLedgerEvent::get_logger()(event),
            Event::Rollback(event) => RollbackEvent::get_logger()(event),
            Event::Propose(event) => ProposeEvent::get_logger()(event),
            Event::ReceiveProposal(event) => ReceiveProposalEvent::get_logger()(event),
            Event::PreCommit(event) => PreCommitEvent::get_logger()(event),
            Event::ProblemReport(event) => ProblemReportEvent::get_logger()(event),
        }
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
