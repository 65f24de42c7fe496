//! Creation of a micro-ledger between an initiator and its acceptors, each in its own thread.

use std::{
    sync::mpsc,
    thread::{self, JoinHandle},
    time::Duration,
};

use coprotocols_rs::{
    consensus::{
        messages::{InitializeCommit, InitializeRequest, InitializeResponse, LedgerClaim, CONSENSUS_PROTOCOL},
        simple::MicroledgerConsensus,
        state_machine::{
            ConsensusStatus, REQUEST_NOT_ACCEPTED, REQUEST_PROCESSING_ERROR, RESPONSE_NOT_ACCEPTED,
        },
        ConsensusError,
    },
    coprotocol::{listener::Listener, theirs::TheirsCoprotocol},
    events::Event,
    ledger::{
        in_memory::{InMemoryLedger, InMemoryLedgerStore},
        Ledger, LedgerError, LedgerStore, Transaction,
    },
    messages::{envelope::generate_id, notifications::ProblemReport, TypedMessage},
    types::signed_field::SignedField,
};
use log::LevelFilter;
use serde_json::json;

mod common;

use crate::common::{
    agents::{agents, Agent},
    logging::setup_logger,
};

const TIME_TO_LIVE: Duration = Duration::from_secs(5);

fn genesis() -> Vec<Transaction> {
    vec![Transaction::from_value(json!({"seq": 1})).unwrap()]
}

/// A store that corrupts the first genesis transaction of every ledger it creates.
#[derive(Clone, Default)]
struct TamperingStore(InMemoryLedgerStore);

impl LedgerStore for TamperingStore {
    type Ledger = InMemoryLedger;

    fn create(&mut self, name: &str, genesis: &[Transaction]) -> Result<InMemoryLedger, LedgerError> {
        let mut genesis = genesis.to_vec();
        if let Some(first) = genesis.first_mut() {
            first.set("tampered", json!(true));
        }
        self.0.create(name, &genesis)
    }

    fn get(&self, name: &str) -> Option<InMemoryLedger> {
        self.0.get(name)
    }

    fn reset(&mut self, name: &str) -> bool {
        self.0.reset(name)
    }
}

/// Start listening as `agent`, then take part in the first creation requested of it on another thread.
fn spawn_acceptor<S: LedgerStore>(
    agent: &Agent,
    agents: &[Agent],
    mut store: S,
) -> JoinHandle<(bool, Option<String>, S)> {
    let mut listener =
        Listener::start(agent.context.clone(), &agent.me, &[CONSENSUS_PROTOCOL]).unwrap();
    let mut consensus =
        MicroledgerConsensus::new(agent.context.clone(), agent.consensus_config(agents, TIME_TO_LIVE));

    thread::spawn(move || {
        let inbound = listener
            .next_where(Some(TIME_TO_LIVE), |inbound| {
                InitializeRequest::matches(&inbound.message)
            })
            .unwrap();
        listener.stop();

        let (accepted, ledger) = consensus.accept_microledger(&mut store, &inbound).unwrap();
        assert_eq!(accepted, ledger.is_some());
        let problem_code = consensus
            .problem_report()
            .map(|report| report.problem_code.clone());
        (accepted, problem_code, store)
    })
}

fn initiator(agents: &[Agent]) -> MicroledgerConsensus<common::agents::TestContext> {
    MicroledgerConsensus::new(
        agents[0].context.clone(),
        agents[0].consensus_config(agents, TIME_TO_LIVE),
    )
}

#[test]
fn every_participant_commits_the_genesis() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["alice", "bob", "carol"]);
    let participants: Vec<_> = agents.iter().map(Agent::did).collect();

    let acceptors: Vec<_> = agents[1..]
        .iter()
        .map(|agent| spawn_acceptor(agent, &agents, InMemoryLedgerStore::new()))
        .collect();

    let (event_publisher, event_subscriber) = mpsc::channel();
    let mut consensus = initiator(&agents).with_event_publisher(event_publisher);
    let mut store = InMemoryLedgerStore::new();
    let (created, ledger) = consensus
        .init_microledger(&mut store, "orders", &participants, &genesis())
        .unwrap();
    assert!(created);
    assert_eq!(consensus.status(), ConsensusStatus::Succeeded);
    let ledger = ledger.unwrap();
    assert_eq!(ledger.size(), 1);
    assert_eq!(ledger.transactions()[0].seq_no(), Some(1));
    assert_eq!(store.get("orders").unwrap().size(), 1);

    for acceptor in acceptors {
        let (accepted, problem_code, acceptor_store) = acceptor.join().unwrap();
        assert!(accepted, "acceptor failed with {problem_code:?}");
        let acceptor_ledger = acceptor_store.get("orders").unwrap();
        assert_eq!(acceptor_ledger.size(), 1);
        assert_eq!(acceptor_ledger.root_hash(), ledger.root_hash());
    }

    let events: Vec<Event> = event_subscriber.try_iter().collect();
    assert!(matches!(events.first(), Some(Event::Propose(_))));
    assert!(matches!(
        events.last(),
        Some(Event::CreateLedger(create)) if create.ledger == "orders" && create.participants == participants
    ));
}

#[test]
fn diverged_genesis_leaves_no_ledger_behind() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["alice", "bob"]);
    let participants: Vec<_> = agents.iter().map(Agent::did).collect();
    let bob = spawn_acceptor(&agents[1], &agents, TamperingStore::default());

    let mut consensus = initiator(&agents);
    let mut store = InMemoryLedgerStore::new();
    let (created, ledger) = consensus
        .init_microledger(&mut store, "orders", &participants, &genesis())
        .unwrap();
    assert!(!created);
    assert!(ledger.is_none());
    assert_eq!(consensus.status(), ConsensusStatus::Failed);
    assert_eq!(
        consensus.problem_report().unwrap().problem_code,
        RESPONSE_NOT_ACCEPTED
    );
    assert!(!store.exists("orders"));

    let (accepted, problem_code, bob_store) = bob.join().unwrap();
    assert!(!accepted);
    assert_eq!(problem_code.as_deref(), Some(REQUEST_PROCESSING_ERROR));
    assert!(!bob_store.exists("orders"));
}

#[test]
fn acceptor_keeps_a_ledger_it_already_had() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["alice", "bob"]);
    let participants: Vec<_> = agents.iter().map(Agent::did).collect();

    let mut bob_store = InMemoryLedgerStore::new();
    let mut existing = bob_store
        .create("orders", &[Transaction::from_value(json!({"mine": true})).unwrap()])
        .unwrap();
    existing.commit().unwrap();
    let existing_root = existing.root_hash();
    let bob = spawn_acceptor(&agents[1], &agents, bob_store);

    let mut consensus = initiator(&agents);
    let mut store = InMemoryLedgerStore::new();
    let (created, _) = consensus
        .init_microledger(&mut store, "orders", &participants, &genesis())
        .unwrap();
    assert!(!created);
    assert!(!store.exists("orders"));

    let (accepted, problem_code, bob_store) = bob.join().unwrap();
    assert!(!accepted);
    assert_eq!(problem_code.as_deref(), Some(REQUEST_NOT_ACCEPTED));
    assert_eq!(bob_store.get("orders").unwrap().root_hash(), existing_root);
}

/// Act as alice by hand: request the creation of "orders" from bob, then send him an
/// [InitializeCommit] whose signatures went through `tamper`. Returns bob's reply to the commit.
fn commit_with_signatures(
    agents: &[Agent],
    tamper: impl FnOnce(&LedgerClaim, Vec<SignedField>) -> Vec<SignedField>,
) -> (ProblemReport, bool, Option<String>, InMemoryLedgerStore) {
    let participants = vec![agents[0].did(), agents[1].did()];
    let bob = spawn_acceptor(&agents[1], agents, InMemoryLedgerStore::new());

    let mut ledger = InMemoryLedger::new("orders");
    ledger.add_transactions(&genesis()).unwrap();
    let claim = LedgerClaim::new("orders", ledger.uncommitted_root_hash());

    let mut coprotocol = TheirsCoprotocol::new(
        agents[0].context.clone(),
        agents[0].me.clone(),
        vec![agents[1].their()],
        generate_id(),
        Some(TIME_TO_LIVE),
    );
    coprotocol.start().unwrap();

    let request = InitializeRequest {
        ledger: claim.ledger.clone(),
        genesis: genesis(),
        root_hash: claim.root_hash,
        participants: participants.clone(),
        signature: claim.sign(&agents[0].me.keypair).unwrap(),
    };
    let mut outcomes = coprotocol.switch(request.to_envelope().unwrap()).unwrap();
    let reply = outcomes.remove(&agents[1].did()).unwrap().value.unwrap();
    let response = InitializeResponse::from_envelope(&reply).unwrap();

    let commit = InitializeCommit {
        ledger: claim.ledger.clone(),
        participants,
        signatures: tamper(&claim, vec![request.signature, response.signature]),
    };
    let mut outcomes = coprotocol.switch(commit.to_envelope().unwrap()).unwrap();
    let reply = outcomes.remove(&agents[1].did()).unwrap().value.unwrap();
    coprotocol.stop();

    let (accepted, problem_code, store) = bob.join().unwrap();
    (
        ProblemReport::from_envelope(&reply).unwrap(),
        accepted,
        problem_code,
        store,
    )
}

#[test]
fn commit_with_an_extra_signer_is_rejected() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["alice", "bob", "carol"]);
    let carol_keypair = agents[2].me.keypair.clone();
    let (report, accepted, problem_code, store) = commit_with_signatures(&agents, |claim, mut signatures| {
        signatures.push(claim.sign(&carol_keypair).unwrap());
        signatures
    });

    assert_eq!(report.problem_code, REQUEST_NOT_ACCEPTED);
    assert!(!accepted);
    assert_eq!(problem_code.as_deref(), Some(REQUEST_NOT_ACCEPTED));
    assert!(!store.exists("orders"));
}

#[test]
fn commit_with_a_missing_signer_is_rejected() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["alice", "bob"]);
    let (report, accepted, problem_code, store) = commit_with_signatures(&agents, |_, mut signatures| {
        signatures.truncate(1);
        signatures
    });

    assert_eq!(report.problem_code, REQUEST_NOT_ACCEPTED);
    assert!(!accepted);
    assert_eq!(problem_code.as_deref(), Some(REQUEST_NOT_ACCEPTED));
    assert!(!store.exists("orders"));
}

#[test]
fn misuse_is_an_error_before_anything_is_sent() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["alice", "bob", "carol"]);
    let mut consensus = initiator(&agents);
    let mut store = InMemoryLedgerStore::new();

    assert!(matches!(
        consensus.init_microledger(&mut store, "orders", &[agents[0].did(), agents[0].did()], &genesis()),
        Err(ConsensusError::NotEnoughParticipants(1))
    ));
    assert!(matches!(
        consensus.init_microledger(&mut store, "orders", &[agents[1].did(), agents[2].did()], &genesis()),
        Err(ConsensusError::NotAParticipant(_))
    ));

    store.create("orders", &genesis()).unwrap();
    assert!(matches!(
        consensus.init_microledger(&mut store, "orders", &[agents[0].did(), agents[1].did()], &genesis()),
        Err(ConsensusError::Ledger(LedgerError::AlreadyExists(_)))
    ));
    assert!(store.exists("orders"));
    assert_eq!(consensus.status(), ConsensusStatus::Idle);
}
