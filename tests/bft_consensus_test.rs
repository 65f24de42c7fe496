//! Three-phase commit among a leader and three acceptors, each in its own thread.

use std::{
    sync::mpsc,
    thread::{self, JoinHandle},
    time::Duration,
};

use coprotocols_rs::{
    consensus::{
        bft::BftConsensus,
        messages::{
            LedgerClaim, StageCommit, StagePostCommit, StagePreCommit, StagePropose,
            CONSENSUS_PROTOCOL,
        },
        state_machine::{
            ConsensusStatus, REQUEST_NOT_ACCEPTED, REQUEST_PROCESSING_ERROR,
            RESPONSE_NOT_ACCEPTED, RESPONSE_PROCESSING_ERROR,
        },
        ConsensusError,
    },
    coprotocol::{listener::Listener, theirs::TheirsCoprotocol, threaded::ThreadedCoprotocol},
    events::Event,
    ledger::{in_memory::InMemoryLedger, Ledger, Transaction},
    messages::{
        envelope::{generate_id, Envelope},
        notifications::ProblemReport,
        TypedMessage,
    },
    types::{data_types::CryptoHash, signed_field::SignedField},
};
use log::LevelFilter;
use serde_json::json;

mod common;

use crate::common::{
    agents::{agents, dids, Agent},
    logging::setup_logger,
};

const TIME_TO_LIVE: Duration = Duration::from_secs(5);

fn txn(value: serde_json::Value) -> Transaction {
    Transaction::from_value(value).unwrap()
}

/// A ledger named "orders" with `genesis` committed.
fn committed_ledger(genesis: &[Transaction]) -> InMemoryLedger {
    let mut ledger = InMemoryLedger::new("orders");
    ledger.add_transactions(genesis).unwrap();
    ledger.commit().unwrap();
    ledger
}

/// Start listening as `agent`, then take part in the first round proposed to it on another thread.
fn spawn_acceptor(
    agent: &Agent,
    agents: &[Agent],
    mut ledger: InMemoryLedger,
) -> JoinHandle<(bool, Option<String>, InMemoryLedger)> {
    let mut listener =
        Listener::start(agent.context.clone(), &agent.me, &[CONSENSUS_PROTOCOL]).unwrap();
    let mut consensus = BftConsensus::new(agent.context.clone(), agent.consensus_config(agents, TIME_TO_LIVE));

    thread::spawn(move || {
        let inbound = listener
            .next_where(Some(TIME_TO_LIVE), |inbound| {
                StagePropose::matches(&inbound.message)
            })
            .unwrap();
        listener.stop();

        let accepted = consensus.accept_commit(&mut ledger, &inbound).unwrap();
        let problem_code = consensus
            .problem_report()
            .map(|report| report.problem_code.clone());
        (accepted, problem_code, ledger)
    })
}

#[test]
fn every_participant_commits_the_proposed_transactions() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize four agents that share a committed ledger.
    let (_network, agents) = agents(&["leader", "alice", "bob", "carol"]);
    let genesis = [txn(json!({"seq": 1}))];
    let participants = dids(&agents);

    // 2. Start the acceptors.
    let acceptors: Vec<_> = agents[1..]
        .iter()
        .map(|agent| spawn_acceptor(agent, &agents, committed_ledger(&genesis)))
        .collect();

    // 3. Propose two transactions.
    let (event_publisher, event_subscriber) = mpsc::channel();
    let mut leader = BftConsensus::new(
        agents[0].context.clone(),
        agents[0].consensus_config(&agents, TIME_TO_LIVE),
    )
    .with_event_publisher(event_publisher);
    let mut ledger = committed_ledger(&genesis);
    let txns = [txn(json!({"order": "a"})), txn(json!({"order": "b"}))];

    log::debug!("Proposing 2 transactions to 3 acceptors.");
    assert!(leader
        .propose_and_commit(&mut ledger, &participants, &txns)
        .unwrap());
    assert_eq!(leader.status(), ConsensusStatus::Succeeded);
    assert!(leader.problem_report().is_none());
    assert_eq!(ledger.size(), 3);

    // 4. Every acceptor committed the same log.
    for acceptor in acceptors {
        let (accepted, problem_code, acceptor_ledger) = acceptor.join().unwrap();
        assert!(accepted, "acceptor failed with {problem_code:?}");
        assert_eq!(acceptor_ledger.size(), 3);
        assert_eq!(acceptor_ledger.root_hash(), ledger.root_hash());
        assert_eq!(acceptor_ledger.transactions()[2].seq_no(), Some(3));
    }

    // 5. The leader published its progress.
    let events: Vec<Event> = event_subscriber.try_iter().collect();
    assert!(matches!(events.first(), Some(Event::Propose(_))));
    assert!(events.iter().any(|event| matches!(
        event,
        Event::CommitLedger(commit) if commit.size == 3 && commit.root_hash == ledger.root_hash()
    )));
    assert!(!events.iter().any(|event| matches!(event, Event::Rollback(_))));
}

#[test]
fn unreachable_acceptor_rolls_the_round_back_everywhere() {
    setup_logger(LevelFilter::Debug);

    // 1. Carol's endpoint goes away before the round starts.
    let (network, agents) = agents(&["leader", "alice", "bob", "carol"]);
    let genesis = [txn(json!({"seq": 1}))];
    let participants = dids(&agents);
    network.unregister(&agents[3].endpoint);

    let acceptors: Vec<_> = agents[1..3]
        .iter()
        .map(|agent| spawn_acceptor(agent, &agents, committed_ledger(&genesis)))
        .collect();

    // 2. The leader gives up and rolls back.
    let mut leader = BftConsensus::new(
        agents[0].context.clone(),
        agents[0].consensus_config(&agents, TIME_TO_LIVE),
    );
    let mut ledger = committed_ledger(&genesis);
    let committed_root = ledger.root_hash();
    assert!(!leader
        .propose_and_commit(&mut ledger, &participants, &[txn(json!({"order": "a"}))])
        .unwrap());
    assert_eq!(leader.status(), ConsensusStatus::Failed);
    assert_eq!(
        leader.problem_report().unwrap().problem_code,
        RESPONSE_PROCESSING_ERROR
    );
    assert_eq!(ledger.size(), 1);
    assert_eq!(ledger.uncommitted_size(), 1);
    assert_eq!(ledger.root_hash(), committed_root);

    // 3. The reachable acceptors hear about it and roll back too.
    for acceptor in acceptors {
        let (accepted, _, acceptor_ledger) = acceptor.join().unwrap();
        assert!(!accepted);
        assert_eq!(acceptor_ledger.uncommitted_size(), 1);
        assert_eq!(acceptor_ledger.root_hash(), committed_root);
    }
}

#[test]
fn diverged_acceptor_rejects_the_proposal() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["leader", "alice", "bob"]);
    let genesis = [txn(json!({"seq": 1}))];
    let participants = dids(&agents);

    // 1. Bob's ledger committed a different genesis.
    let alice = spawn_acceptor(&agents[1], &agents, committed_ledger(&genesis));
    let bob = spawn_acceptor(&agents[2], &agents, committed_ledger(&[txn(json!({"seq": 2}))]));

    let mut leader = BftConsensus::new(
        agents[0].context.clone(),
        agents[0].consensus_config(&agents, TIME_TO_LIVE),
    );
    let mut ledger = committed_ledger(&genesis);
    assert!(!leader
        .propose_and_commit(&mut ledger, &participants, &[txn(json!({"order": "a"}))])
        .unwrap());
    assert_eq!(
        leader.problem_report().unwrap().problem_code,
        RESPONSE_NOT_ACCEPTED
    );
    assert_eq!(ledger.uncommitted_size(), 1);

    let (accepted, problem_code, bob_ledger) = bob.join().unwrap();
    assert!(!accepted);
    assert_eq!(problem_code.as_deref(), Some(REQUEST_PROCESSING_ERROR));
    assert_eq!(bob_ledger.uncommitted_size(), 1);

    let (accepted, _, alice_ledger) = alice.join().unwrap();
    assert!(!accepted);
    assert_eq!(alice_ledger.uncommitted_size(), 1);
}

#[test]
fn leader_must_be_a_known_participant() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["leader", "alice"]);
    let mut leader = BftConsensus::new(
        agents[0].context.clone(),
        agents[0].consensus_config(&agents, TIME_TO_LIVE),
    );
    let mut ledger = committed_ledger(&[txn(json!({"seq": 1}))]);

    let txns = [txn(json!({"order": "a"}))];

    assert!(matches!(
        leader.propose_and_commit(&mut ledger, &[agents[1].did()], &txns),
        Err(ConsensusError::NotAParticipant(_))
    ));
    assert!(matches!(
        leader.propose_and_commit(
            &mut ledger,
            &[agents[0].did(), "did:peer:stranger".into()],
            &txns
        ),
        Err(ConsensusError::UnknownParticipant(_))
    ));
    assert_eq!(leader.status(), ConsensusStatus::Idle);
}

#[test]
fn empty_proposal_is_an_error_before_anything_is_sent() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["leader", "alice"]);
    let participants = dids(&agents);
    let mut leader = BftConsensus::new(
        agents[0].context.clone(),
        agents[0].consensus_config(&agents, TIME_TO_LIVE),
    );
    let mut ledger = committed_ledger(&[txn(json!({"seq": 1}))]);

    assert!(matches!(
        leader.propose_and_commit(&mut ledger, &participants, &[]),
        Err(ConsensusError::NothingToPropose)
    ));
    assert_eq!(leader.status(), ConsensusStatus::Idle);
    assert_eq!(ledger.uncommitted_size(), 1);
    assert_eq!(agents[1].hub.subscription_count(), 0);
}

/// Take part, by hand, in the first round proposed to `agent` by `leader`: answer the proposal with
/// whatever `reply` builds, then ignore everything but a problem report. Returns the reported code.
fn spawn_scripted_acceptor(
    agent: &Agent,
    leader: &Agent,
    reply: impl FnOnce(&LedgerClaim) -> Envelope + Send + 'static,
) -> JoinHandle<Option<String>> {
    let mut listener =
        Listener::start(agent.context.clone(), &agent.me, &[CONSENSUS_PROTOCOL]).unwrap();
    let context = agent.context.clone();
    let pairwise = agent.pairwise_with(leader);

    thread::spawn(move || {
        let inbound = listener
            .next_where(Some(TIME_TO_LIVE), |inbound| {
                StagePropose::matches(&inbound.message)
            })
            .unwrap();
        listener.stop();

        let propose = StagePropose::from_envelope(&inbound.message).unwrap();
        let claim = LedgerClaim::new(propose.ledger, propose.uncommitted_root_hash);
        let thid = inbound
            .message
            .thread_id()
            .unwrap_or(inbound.message.id())
            .to_string();
        let mut coprotocol = ThreadedCoprotocol::new(context, pairwise, thid, Some(TIME_TO_LIVE));
        coprotocol.start().unwrap();
        coprotocol.send(reply(&claim)).unwrap();

        let problem_code = loop {
            match coprotocol.get_one() {
                Ok(inbound) if ProblemReport::matches(&inbound.message) => {
                    break Some(
                        ProblemReport::from_envelope(&inbound.message)
                            .unwrap()
                            .problem_code,
                    )
                }
                Ok(_) => continue,
                Err(_) => break None,
            }
        };
        coprotocol.stop();
        problem_code
    })
}

#[test]
fn acceptor_silent_after_pre_commit_times_the_leader_out() {
    setup_logger(LevelFilter::Debug);

    // 1. Carol pre-commits, then never answers the commit.
    let (_network, agents) = agents(&["leader", "alice", "carol"]);
    let genesis = [txn(json!({"seq": 1}))];
    let participants = dids(&agents);
    let alice = spawn_acceptor(&agents[1], &agents, committed_ledger(&genesis));
    let carol_keypair = agents[2].me.keypair.clone();
    let carol = spawn_scripted_acceptor(&agents[2], &agents[0], move |claim| {
        StagePreCommit {
            signature: claim.sign(&carol_keypair).unwrap(),
        }
        .to_envelope()
        .unwrap()
    });

    // 2. The leader gives up on the post-commits, rolls back, and tells everyone.
    let mut leader = BftConsensus::new(
        agents[0].context.clone(),
        agents[0].consensus_config(&agents, Duration::from_secs(1)),
    );
    let mut ledger = committed_ledger(&genesis);
    let committed_root = ledger.root_hash();
    assert!(!leader
        .propose_and_commit(&mut ledger, &participants, &[txn(json!({"order": "a"}))])
        .unwrap());
    assert_eq!(leader.status(), ConsensusStatus::Failed);
    assert_eq!(
        leader.problem_report().unwrap().problem_code,
        RESPONSE_PROCESSING_ERROR
    );
    assert_eq!(ledger.uncommitted_size(), 1);
    assert_eq!(ledger.root_hash(), committed_root);

    assert_eq!(
        carol.join().unwrap().as_deref(),
        Some(RESPONSE_PROCESSING_ERROR)
    );
    // Alice saw a complete commit and acknowledged it before the leader gave up.
    let (accepted, _, alice_ledger) = alice.join().unwrap();
    assert!(accepted);
    assert_eq!(alice_ledger.size(), 2);
}

#[test]
fn pre_commit_of_the_wrong_type_rolls_the_round_back_everywhere() {
    setup_logger(LevelFilter::Debug);

    // 1. Carol answers the proposal with a post-commit.
    let (_network, agents) = agents(&["leader", "alice", "carol"]);
    let genesis = [txn(json!({"seq": 1}))];
    let participants = dids(&agents);
    let alice = spawn_acceptor(&agents[1], &agents, committed_ledger(&genesis));
    let carol_keypair = agents[2].me.keypair.clone();
    let carol = spawn_scripted_acceptor(&agents[2], &agents[0], move |claim| {
        StagePostCommit {
            signature: claim.sign(&carol_keypair).unwrap(),
        }
        .to_envelope()
        .unwrap()
    });

    let mut leader = BftConsensus::new(
        agents[0].context.clone(),
        agents[0].consensus_config(&agents, TIME_TO_LIVE),
    );
    let mut ledger = committed_ledger(&genesis);
    assert!(!leader
        .propose_and_commit(&mut ledger, &participants, &[txn(json!({"order": "a"}))])
        .unwrap());
    assert_eq!(
        leader.problem_report().unwrap().problem_code,
        RESPONSE_NOT_ACCEPTED
    );
    assert_eq!(ledger.uncommitted_size(), 1);

    // 2. Alice, waiting for the commit, hears about it and rolls back too.
    let (accepted, problem_code, alice_ledger) = alice.join().unwrap();
    assert!(!accepted);
    assert_eq!(problem_code.as_deref(), Some(REQUEST_NOT_ACCEPTED));
    assert_eq!(alice_ledger.uncommitted_size(), 1);
    assert_eq!(carol.join().unwrap().as_deref(), Some(RESPONSE_NOT_ACCEPTED));
}

/// Act as the leader by hand: propose `txns` to alice and, if she pre-commits, send her a [StageCommit]
/// whose pre-commits went through `tamper`. Returns her last reply and how her round ended.
fn commit_with_pre_commits(
    agents: &[Agent],
    txns: Vec<Transaction>,
    tamper: impl FnOnce(&LedgerClaim, Vec<SignedField>) -> Vec<SignedField>,
) -> (Envelope, bool, Option<String>, InMemoryLedger) {
    let genesis = [txn(json!({"seq": 1}))];
    let participants = vec![agents[0].did(), agents[1].did()];
    let alice = spawn_acceptor(&agents[1], agents, committed_ledger(&genesis));

    let mut ledger = committed_ledger(&genesis);
    ledger.add_transactions(&txns).unwrap();
    let claim = LedgerClaim::new("orders", ledger.uncommitted_root_hash());

    let mut coprotocol = TheirsCoprotocol::new(
        agents[0].context.clone(),
        agents[0].me.clone(),
        vec![agents[1].their()],
        generate_id(),
        Some(TIME_TO_LIVE),
    );
    coprotocol.start().unwrap();

    let propose = StagePropose {
        ledger: claim.ledger.clone(),
        transactions: txns,
        uncommitted_root_hash: claim.root_hash,
        participants,
        signature: claim.sign(&agents[0].me.keypair).unwrap(),
    };
    let mut outcomes = coprotocol.switch(propose.to_envelope().unwrap()).unwrap();
    let mut reply = outcomes.remove(&agents[1].did()).unwrap().value.unwrap();
    if StagePreCommit::matches(&reply) {
        let pre_commit = StagePreCommit::from_envelope(&reply).unwrap();
        let commit = StageCommit {
            pre_commits: tamper(&claim, vec![pre_commit.signature]),
        };
        let mut outcomes = coprotocol.switch(commit.to_envelope().unwrap()).unwrap();
        reply = outcomes.remove(&agents[1].did()).unwrap().value.unwrap();
    }
    coprotocol.stop();

    let (accepted, problem_code, alice_ledger) = alice.join().unwrap();
    (reply, accepted, problem_code, alice_ledger)
}

/// Alice must have answered with a problem report, and be back where she started.
fn assert_rejected(outcome: (Envelope, bool, Option<String>, InMemoryLedger)) {
    let (reply, accepted, problem_code, alice_ledger) = outcome;
    assert_eq!(
        ProblemReport::from_envelope(&reply).unwrap().problem_code,
        REQUEST_NOT_ACCEPTED
    );
    assert!(!accepted);
    assert_eq!(problem_code.as_deref(), Some(REQUEST_NOT_ACCEPTED));
    assert_eq!(alice_ledger.size(), 1);
    assert_eq!(alice_ledger.uncommitted_size(), 1);
}

#[test]
fn commit_missing_a_pre_commit_is_rejected() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["leader", "alice"]);
    assert_rejected(commit_with_pre_commits(
        &agents,
        vec![txn(json!({"order": "a"}))],
        |_, _| Vec::new(),
    ));
}

#[test]
fn commit_with_an_extra_pre_commit_is_rejected() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["leader", "alice", "carol"]);
    let carol_keypair = agents[2].me.keypair.clone();
    assert_rejected(commit_with_pre_commits(
        &agents,
        vec![txn(json!({"order": "a"}))],
        |claim, mut pre_commits| {
            pre_commits.push(claim.sign(&carol_keypair).unwrap());
            pre_commits
        },
    ));
}

#[test]
fn commit_with_a_pre_commit_for_another_root_is_rejected() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["leader", "alice"]);
    let alice_keypair = agents[1].me.keypair.clone();
    assert_rejected(commit_with_pre_commits(
        &agents,
        vec![txn(json!({"order": "a"}))],
        |claim, _| {
            let other_root = LedgerClaim::new(claim.ledger.clone(), CryptoHash::new([7; 32]));
            vec![other_root.sign(&alice_keypair).unwrap()]
        },
    ));
}

#[test]
fn acceptor_rejects_an_empty_proposal() {
    setup_logger(LevelFilter::Debug);

    let (_network, agents) = agents(&["leader", "alice"]);
    assert_rejected(commit_with_pre_commits(&agents, Vec::new(), |_, pre_commits| {
        pre_commits
    }));
}
