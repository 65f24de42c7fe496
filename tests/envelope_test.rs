use coprotocols_rs::{
    consensus::messages::{ConsensusMessage, LedgerClaim, StagePreCommit, CONSENSUS_PROTOCOL},
    messages::{
        envelope::{Envelope, EnvelopeError, Thread},
        message_type::{MessageType, DIDCOMM_DOC_URI, SOV_DOC_URI},
        notifications::{Ack, AckStatus, ProblemReport},
        TypedMessage,
    },
    types::{crypto_primitives::Keypair, data_types::CryptoHash},
};
use serde_json::json;

#[test]
fn unknown_fields_survive_a_round_trip() {
    let value = json!({
        "@type": "https://didcomm.org/test-protocol/1.0/ping",
        "@id": "message-1",
        "~thread": { "thid": "thread-1", "sender_order": 3, "received_orders": { "did:peer:bob": 1 } },
        "comment": "hi",
        "nested": { "a": [1, 2, 3] }
    });

    let envelope = Envelope::from_value(value.clone()).unwrap();
    assert_eq!(envelope.id(), "message-1");
    assert_eq!(envelope.thread_id(), Some("thread-1"));
    assert_eq!(envelope.thread().unwrap().sender_order, Some(3));
    assert_eq!(envelope.field("comment"), Some(&json!("hi")));

    assert_eq!(envelope.to_value().unwrap(), value);

    let bytes = envelope.to_bytes().unwrap();
    assert_eq!(Envelope::from_bytes(&bytes).unwrap(), envelope);
}

#[test]
fn missing_id_is_generated() {
    let envelope = Envelope::from_value(json!({
        "@type": "https://didcomm.org/test-protocol/1.0/ping"
    }))
    .unwrap();
    assert!(!envelope.id().is_empty());
    assert!(envelope.thread().is_none());
}

#[test]
fn thread_ids_must_not_collide() {
    let mut envelope = Envelope::new(MessageType::new(DIDCOMM_DOC_URI, "test-protocol", "1.0", "ping"));
    let id = envelope.id().to_string();

    assert!(matches!(
        envelope.set_thread(Thread::new(id.clone())),
        Err(EnvelopeError::ThreadIdCollision(_))
    ));
    assert!(matches!(
        envelope.set_thread(Thread::new("")),
        Err(EnvelopeError::MissingThreadId)
    ));
    let mut thread = Thread::new("thread-1");
    thread.pthid = Some("thread-1".to_string());
    assert!(matches!(
        envelope.set_thread(thread),
        Err(EnvelopeError::ThreadIdCollision(_))
    ));

    let mut thread = Thread::new("thread-1");
    thread.pthid = Some("parent-1".to_string());
    envelope.set_thread(thread).unwrap();
    assert_eq!(envelope.thread_id(), Some("thread-1"));
    assert_eq!(envelope.id(), id);

    // Decoded envelopes are held to the same rules.
    let colliding = json!({
        "@type": "https://didcomm.org/test-protocol/1.0/ping",
        "@id": "same",
        "~thread": { "thid": "same" }
    });
    assert!(Envelope::from_value(colliding).is_err());
}

#[test]
fn decorator_keys_are_not_payload_fields() {
    let mut envelope = Envelope::new(MessageType::new(DIDCOMM_DOC_URI, "test-protocol", "1.0", "ping"));
    assert!(matches!(
        envelope.set_field("~thread", json!({})),
        Err(EnvelopeError::ReservedField(_))
    ));
    assert!(matches!(
        envelope.set_field("@id", json!("x")),
        Err(EnvelopeError::ReservedField(_))
    ));

    envelope.set_please_ack(true);
    assert_eq!(envelope.please_ack().unwrap().message_id, envelope.id());
    envelope.set_please_ack(false);
    assert!(envelope.please_ack().is_none());
}

#[test]
fn message_types_parse_and_compare() {
    let parsed: MessageType = "https://didcomm.org/simple-consensus/1.0/stage-propose"
        .parse()
        .unwrap();
    assert_eq!(parsed.doc_uri(), DIDCOMM_DOC_URI);
    assert_eq!(parsed.protocol(), CONSENSUS_PROTOCOL);
    assert_eq!(parsed.version(), "1.0");
    assert_eq!(parsed.name(), "stage-propose");
    assert_eq!(parsed.to_string(), "https://didcomm.org/simple-consensus/1.0/stage-propose");

    let legacy: MessageType = format!("{SOV_DOC_URI}simple-consensus/1.3/stage-propose")
        .parse()
        .unwrap();
    assert!(parsed.same_message(&legacy));

    let next_major: MessageType = "https://didcomm.org/simple-consensus/2.0/stage-propose"
        .parse()
        .unwrap();
    assert!(!parsed.same_message(&next_major));

    assert!("stage-propose".parse::<MessageType>().is_err());
    assert!("https://didcomm.org//1.0/ping".parse::<MessageType>().is_err());
}

#[test]
fn typed_messages_map_to_envelopes() {
    let report = ProblemReport::new("request_not_accepted", "unknown ledger");
    let envelope = report.to_envelope().unwrap();
    assert!(ProblemReport::matches(&envelope));
    assert!(!Ack::matches(&envelope));
    assert_eq!(ProblemReport::from_envelope(&envelope).unwrap(), report);
    assert!(matches!(
        Ack::from_envelope(&envelope),
        Err(EnvelopeError::UnexpectedType { .. })
    ));

    let mut acked = Envelope::new(MessageType::new(DIDCOMM_DOC_URI, "test-protocol", "1.0", "ping"));
    acked.set_please_ack(true);
    let ack = Ack::acknowledging(&acked).unwrap();
    assert_eq!(ack.thread_id(), Some(acked.id()));
    assert_eq!(Ack::from_envelope(&ack).unwrap().status, AckStatus::Ok);
}

#[test]
fn consensus_messages_parse_into_their_variant() {
    let keypair = Keypair::generate();
    let claim = LedgerClaim::new("orders", CryptoHash::new([7; 32]));
    let pre_commit = StagePreCommit {
        signature: claim.sign(&keypair).unwrap(),
    };

    let envelope = pre_commit.to_envelope().unwrap();
    let parsed = ConsensusMessage::parse(&envelope).unwrap();
    assert_eq!(parsed, ConsensusMessage::StagePreCommit(pre_commit.clone()));
    assert_eq!(parsed.name(), "stage-pre-commit");
    assert!(!parsed.starts_round());

    assert_eq!(claim.verify(&pre_commit.signature).unwrap(), keypair.public());
    let other_claim = LedgerClaim::new("orders", CryptoHash::new([8; 32]));
    assert!(other_claim.verify(&pre_commit.signature).is_err());

    let other = Envelope::new(MessageType::new(DIDCOMM_DOC_URI, "test-protocol", "1.0", "ping"));
    assert!(matches!(
        ConsensusMessage::parse(&other).unwrap(),
        ConsensusMessage::Other(_)
    ));

    // A known type with a body that does not decode is an error, not `Other`.
    let broken = Envelope::new(StagePreCommit::message_type());
    assert!(ConsensusMessage::parse(&broken).is_err());
}
