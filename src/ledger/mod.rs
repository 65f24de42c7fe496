/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Append-only transaction logs replicated by the consensus state machines.
//!
//! A [`Ledger`] holds two views of its log:
//! 1. The committed transactions, fingerprinted by [`root_hash`](Ledger::root_hash).
//! 2. The committed transactions followed by the pending ones, fingerprinted by
//!    [`uncommitted_root_hash`](Ledger::uncommitted_root_hash).
//!
//! Consensus appends pending transactions, compares uncommitted root hashes across participants, and
//! then either [`commit`](Ledger::commit)s or [`reset_uncommitted`](Ledger::reset_uncommitted)s.
//!
//! Ledgers are kept in a [`LedgerStore`] by name. Creating a ledger from a genesis transaction set
//! leaves the genesis pending, so that a micro-ledger only becomes committed once its participants agreed
//! on it.
//!
//! This crate provides [`InMemoryLedger`](in_memory::InMemoryLedger) and
//! [`InMemoryLedgerStore`](in_memory::InMemoryLedgerStore). Implementations backed by real storage can
//! be plugged in by implementing the two traits.

pub mod in_memory;

pub mod merkle;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::data_types::CryptoHash;

pub const TXN_METADATA: &str = "txnMetadata";
pub const SEQ_NO: &str = "seqNo";

/// One ledger entry: an arbitrary JSON object.
///
/// When a transaction is appended to a ledger, its `txnMetadata.seqNo` is set to its 1-based position in
/// the log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transaction(Map<String, Value>);

impl Transaction {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Wrap `value`, which must be a JSON object.
    pub fn from_value(value: Value) -> Result<Self, LedgerError> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(LedgerError::InvalidTransaction(other.to_string())),
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.0.insert(name.to_string(), value);
    }

    pub fn seq_no(&self) -> Option<u64> {
        self.0
            .get(TXN_METADATA)
            .and_then(|metadata| metadata.get(SEQ_NO))
            .and_then(Value::as_u64)
    }

    pub(crate) fn set_seq_no(&mut self, seq_no: u64) {
        let metadata = self
            .0
            .entry(TXN_METADATA)
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        if let Value::Object(metadata) = metadata {
            metadata.insert(SEQ_NO.to_string(), Value::from(seq_no));
        }
    }

    /// Canonical bytes of this transaction: compact JSON with keys in sorted order.
    pub fn to_bytes(&self) -> Vec<u8> {
        // `Map` is ordered by key, and serializing a `Value` cannot fail.
        serde_json::to_vec(&self.0).unwrap_or_default()
    }
}

pub trait Ledger: Clone + Send + 'static {
    fn name(&self) -> String;

    /// Number of committed transactions.
    fn size(&self) -> u64;

    /// Number of committed plus pending transactions.
    fn uncommitted_size(&self) -> u64;

    fn root_hash(&self) -> CryptoHash;

    fn uncommitted_root_hash(&self) -> CryptoHash;

    /// Committed transactions, in log order.
    fn transactions(&self) -> Vec<Transaction>;

    /// Append `txns` to the pending set. Returns the appended transactions with their sequence numbers.
    fn add_transactions(&mut self, txns: &[Transaction]) -> Result<Vec<Transaction>, LedgerError>;

    fn add_transaction(&mut self, txn: Transaction) -> Result<Transaction, LedgerError> {
        self.add_transactions(std::slice::from_ref(&txn))?
            .pop()
            .ok_or_else(|| LedgerError::InvalidTransaction("nothing was appended".to_string()))
    }

    /// Make every pending transaction committed. Returns the new committed size.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NothingToCommit`] if nothing is pending.
    fn commit(&mut self) -> Result<u64, LedgerError>;

    /// Drop every pending transaction, so that `uncommitted_root_hash() == root_hash()`.
    fn reset_uncommitted(&mut self);
}

pub trait LedgerStore: Clone + Send + 'static {
    type Ledger: Ledger;

    /// Create ledger `name` with `genesis` as its pending transactions.
    ///
    /// # Errors
    ///
    /// [`LedgerError::AlreadyExists`] if a ledger with that name exists.
    fn create(&mut self, name: &str, genesis: &[Transaction]) -> Result<Self::Ledger, LedgerError>;

    fn get(&self, name: &str) -> Option<Self::Ledger>;

    fn exists(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove ledger `name`. Returns whether it existed.
    fn reset(&mut self, name: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger {0} already exists")]
    AlreadyExists(String),
    #[error("ledger {0} does not exist")]
    NotFound(String),
    #[error("there are no pending transactions to commit")]
    NothingToCommit,
    #[error("transaction is not a JSON object: {0}")]
    InvalidTransaction(String),
}
