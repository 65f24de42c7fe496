/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Runs user-supplied handlers for consensus [events](crate::events) on a thread of their own.
//!
//! Consensus state machines publish events on an `mpsc` channel (see
//! [`with_event_publisher`](crate::consensus::bft::BftConsensus::with_event_publisher)). Hand the
//! receiving end to [`start_event_dispatcher`] together with an [`EventHandlers`] to have every event fed
//! to the handlers registered for its kind.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

#[derive(Default)]
pub struct EventHandlers {
    create_ledger_handlers: Vec<HandlerPtr<CreateLedgerEvent>>,
    commit_ledger_handlers: Vec<HandlerPtr<CommitLedgerEvent>>,
    rollback_handlers: Vec<HandlerPtr<RollbackEvent>>,
    propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    receive_proposal_handlers: Vec<HandlerPtr<ReceiveProposalEvent>>,
    pre_commit_handlers: Vec<HandlerPtr<PreCommitEvent>>,
    problem_report_handlers: Vec<HandlerPtr<ProblemReportEvent>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the default [logging](crate::logging) handler for every event kind.
    pub fn with_default_loggers(mut self) -> Self {
        self.create_ledger_handlers.push(CreateLedgerEvent::get_logger());
        self.commit_ledger_handlers.push(CommitLedgerEvent::get_logger());
        self.rollback_handlers.push(RollbackEvent::get_logger());
        self.propose_handlers.push(ProposeEvent::get_logger());
        self.receive_proposal_handlers.push(ReceiveProposalEvent::get_logger());
        self.pre_commit_handlers.push(PreCommitEvent::get_logger());
        self.problem_report_handlers.push(ProblemReportEvent::get_logger());
        self
    }

    pub fn on_create_ledger(mut self, handler: impl Fn(&CreateLedgerEvent) + Send + 'static) -> Self {
        self.create_ledger_handlers.push(Box::new(handler));
        self
    }

    pub fn on_commit_ledger(mut self, handler: impl Fn(&CommitLedgerEvent) + Send + 'static) -> Self {
        self.commit_ledger_handlers.push(Box::new(handler));
        self
    }

    pub fn on_rollback(mut self, handler: impl Fn(&RollbackEvent) + Send + 'static) -> Self {
        self.rollback_handlers.push(Box::new(handler));
        self
    }

    pub fn on_propose(mut self, handler: impl Fn(&ProposeEvent) + Send + 'static) -> Self {
        self.propose_handlers.push(Box::new(handler));
        self
    }

    pub fn on_receive_proposal(
        mut self,
        handler: impl Fn(&ReceiveProposalEvent) + Send + 'static,
    ) -> Self {
        self.receive_proposal_handlers.push(Box::new(handler));
        self
    }

    pub fn on_pre_commit(mut self, handler: impl Fn(&PreCommitEvent) + Send + 'static) -> Self {
        self.pre_commit_handlers.push(Box::new(handler));
        self
    }

    pub fn on_problem_report(
        mut self,
        handler: impl Fn(&ProblemReportEvent) + Send + 'static,
    ) -> Self {
        self.problem_report_handlers.push(Box::new(handler));
        self
    }

    pub fn fire_handlers(&self, event: Event) {
        match event {
            Event::CreateLedger(create_ledger_event) => self
                .create_ledger_handlers
                .iter()
                .for_each(|handler| handler(&create_ledger_event)),

            Event::CommitLedger(commit_ledger_event) => self
                .commit_ledger_handlers
                .iter()
                .for_each(|handler| handler(&commit_ledger_event)),

            Event::Rollback(rollback_event) => self
                .rollback_handlers
                .iter()
                .for_each(|handler| handler(&rollback_event)),

            Event::Propose(propose_event) => self
                .propose_handlers
                .iter()
                .for_each(|handler| handler(&propose_event)),

            Event::ReceiveProposal(receive_proposal_event) => self
                .receive_proposal_handlers
                .iter()
                .for_each(|handler| handler(&receive_proposal_event)),

            Event::PreCommit(pre_commit_event) => self
                .pre_commit_handlers
                .iter()
                .for_each(|handler| handler(&pre_commit_event)),

            Event::ProblemReport(problem_report_event) => self
                .problem_report_handlers
                .iter()
                .for_each(|handler| handler(&problem_report_event)),
        }
    }
}

/// Spawn the dispatcher thread. It exits when `shutdown_signal` fires or is dropped, or when every
/// publisher has hung up.
pub fn start_event_dispatcher(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(SHUTDOWN_POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
