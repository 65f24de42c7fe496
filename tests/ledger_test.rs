use coprotocols_rs::{
    ledger::{
        in_memory::{InMemoryLedger, InMemoryLedgerStore},
        merkle::merkle_root,
        Ledger, LedgerError, LedgerStore, Transaction,
    },
    types::crypto_primitives::hash,
};
use serde_json::json;

fn txn(value: serde_json::Value) -> Transaction {
    Transaction::from_value(value).unwrap()
}

#[test]
fn appended_transactions_get_sequence_numbers() {
    let mut ledger = InMemoryLedger::new("orders");
    let appended = ledger
        .add_transactions(&[txn(json!({"item": "a"})), txn(json!({"item": "b"}))])
        .unwrap();
    assert_eq!(appended[0].seq_no(), Some(1));
    assert_eq!(appended[1].seq_no(), Some(2));
    assert_eq!(appended[1].get("item"), Some(&json!("b")));

    assert_eq!(ledger.size(), 0);
    assert_eq!(ledger.uncommitted_size(), 2);
    assert_eq!(ledger.commit().unwrap(), 2);

    let third = ledger.add_transaction(txn(json!({"item": "c"}))).unwrap();
    assert_eq!(third.seq_no(), Some(3));
    assert_eq!(ledger.transactions().len(), 2);
}

#[test]
fn root_hashes_track_committed_and_pending_state() {
    let mut ledger = InMemoryLedger::new("orders");
    let empty_root = ledger.root_hash();
    assert_eq!(empty_root, hash(b""));
    assert_eq!(ledger.uncommitted_root_hash(), empty_root);

    ledger.add_transaction(txn(json!({"seq": 1}))).unwrap();
    assert_eq!(ledger.root_hash(), empty_root);
    assert_ne!(ledger.uncommitted_root_hash(), empty_root);

    let pending_root = ledger.uncommitted_root_hash();
    ledger.commit().unwrap();
    assert_eq!(ledger.root_hash(), pending_root);
    assert_eq!(ledger.root_hash(), merkle_root(&ledger.transactions()));

    ledger.add_transaction(txn(json!({"seq": 2}))).unwrap();
    ledger.reset_uncommitted();
    assert_eq!(ledger.uncommitted_root_hash(), ledger.root_hash());
    assert!(matches!(ledger.commit(), Err(LedgerError::NothingToCommit)));
}

#[test]
fn merkle_root_depends_on_order_and_content() {
    let a = txn(json!({"a": 1}));
    let b = txn(json!({"b": 2}));
    let c = txn(json!({"c": 3}));

    assert_ne!(merkle_root([&a, &b]), merkle_root([&b, &a]));
    assert_ne!(merkle_root([&a, &b]), merkle_root([&a, &b, &c]));
    assert_ne!(merkle_root([&a]), hash(&a.to_bytes()));
    assert_eq!(merkle_root([&a, &b, &c]), merkle_root(vec![&a, &b, &c]));
}

#[test]
fn transactions_must_be_json_objects() {
    assert!(matches!(
        Transaction::from_value(json!([1, 2])),
        Err(LedgerError::InvalidTransaction(_))
    ));
}

#[test]
fn store_hands_out_shared_ledgers() {
    let mut store = InMemoryLedgerStore::new();
    let genesis = [txn(json!({"seq": 1}))];

    let mut created = store.create("orders", &genesis).unwrap();
    assert!(store.exists("orders"));
    assert!(matches!(
        store.create("orders", &genesis),
        Err(LedgerError::AlreadyExists(_))
    ));

    // Genesis stays pending until committed, and every handle sees the commit.
    assert_eq!(created.size(), 0);
    created.commit().unwrap();
    assert_eq!(store.get("orders").unwrap().size(), 1);

    assert!(store.reset("orders"));
    assert!(!store.exists("orders"));
    assert!(!store.reset("orders"));
}
