/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Volatile, in-memory [`Ledger`] and [`LedgerStore`].
//!
//! An [`InMemoryLedger`] is a handle: clones share the same log. The store hands out such handles, so
//! that the ledger a consensus round mutates is the one the store holds.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::types::data_types::CryptoHash;

use super::{merkle::merkle_root, Ledger, LedgerError, LedgerStore, Transaction};

#[derive(Debug, Default)]
struct LedgerState {
    committed: Vec<Transaction>,
    uncommitted: Vec<Transaction>,
}

#[derive(Clone, Debug)]
pub struct InMemoryLedger {
    name: String,
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedger {
    /// Create an empty ledger that is not kept in any store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(LedgerState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pending transactions, in log order.
    pub fn uncommitted_transactions(&self) -> Vec<Transaction> {
        self.lock().uncommitted.clone()
    }
}

impl Ledger for InMemoryLedger {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn size(&self) -> u64 {
        self.lock().committed.len() as u64
    }

    fn uncommitted_size(&self) -> u64 {
        let state = self.lock();
        (state.committed.len() + state.uncommitted.len()) as u64
    }

    fn root_hash(&self) -> CryptoHash {
        merkle_root(&self.lock().committed)
    }

    fn uncommitted_root_hash(&self) -> CryptoHash {
        let state = self.lock();
        merkle_root(state.committed.iter().chain(&state.uncommitted))
    }

    fn transactions(&self) -> Vec<Transaction> {
        self.lock().committed.clone()
    }

    fn add_transactions(&mut self, txns: &[Transaction]) -> Result<Vec<Transaction>, LedgerError> {
        let mut state = self.lock();
        let mut next_seq_no = (state.committed.len() + state.uncommitted.len()) as u64 + 1;
        let mut appended = Vec::with_capacity(txns.len());
        for txn in txns {
            let mut txn = txn.clone();
            txn.set_seq_no(next_seq_no);
            next_seq_no += 1;
            appended.push(txn);
        }
        state.uncommitted.extend(appended.iter().cloned());
        Ok(appended)
    }

    fn commit(&mut self) -> Result<u64, LedgerError> {
        let mut state = self.lock();
        if state.uncommitted.is_empty() {
            return Err(LedgerError::NothingToCommit);
        }
        let pending = std::mem::take(&mut state.uncommitted);
        state.committed.extend(pending);
        Ok(state.committed.len() as u64)
    }

    fn reset_uncommitted(&mut self) {
        self.lock().uncommitted.clear();
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryLedgerStore(Arc<Mutex<HashMap<String, InMemoryLedger>>>);

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InMemoryLedger>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LedgerStore for InMemoryLedgerStore {
    type Ledger = InMemoryLedger;

    fn create(&mut self, name: &str, genesis: &[Transaction]) -> Result<InMemoryLedger, LedgerError> {
        let mut ledgers = self.lock();
        if ledgers.contains_key(name) {
            return Err(LedgerError::AlreadyExists(name.to_string()));
        }
        let mut ledger = InMemoryLedger::new(name);
        ledger.add_transactions(genesis)?;
        ledgers.insert(name.to_string(), ledger.clone());
        Ok(ledger)
    }

    fn get(&self, name: &str) -> Option<InMemoryLedger> {
        self.lock().get(name).cloned()
    }

    fn reset(&mut self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }
}
