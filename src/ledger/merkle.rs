/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Merkle root over a transaction log.
//!
//! Leaves are `SHA256(0x00 || txn_bytes)` and inner nodes are `SHA256(0x01 || left || right)`, so a leaf
//! can never be confused with an inner node. A node without a sibling is promoted to the next level
//! unchanged. The root of an empty log is `SHA256("")`.

use crate::types::{
    crypto_primitives::{CryptoHasher, Digest},
    data_types::CryptoHash,
};

use super::Transaction;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub fn merkle_root<'a>(txns: impl IntoIterator<Item = &'a Transaction>) -> CryptoHash {
    let mut level: Vec<CryptoHash> = txns.into_iter().map(leaf_hash).collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .filter_map(|pair| {
                pair.iter()
                    .copied()
                    .reduce(|left, right| node_hash(&left, &right))
            })
            .collect();
    }
    level
        .pop()
        .unwrap_or_else(|| CryptoHash::new(CryptoHasher::new().finalize().into()))
}

fn leaf_hash(txn: &Transaction) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(txn.to_bytes());
    CryptoHash::new(hasher.finalize().into())
}

fn node_hash(left: &CryptoHash, right: &CryptoHash) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.bytes());
    hasher.update(right.bytes());
    CryptoHash::new(hasher.finalize().into())
}
