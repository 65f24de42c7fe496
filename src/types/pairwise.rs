/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Party references: who "I" am, who "they" are, and a directory of known peers.

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Formatter},
};

use super::{
    crypto_primitives::{verkey_to_base64, Keypair, VerifyingKey},
    data_types::Did,
};

/// The local end of a relationship: a DID and the keypair that speaks for it.
#[derive(Clone)]
pub struct Me {
    pub did: Did,
    pub keypair: Keypair,
}

impl Me {
    pub fn new(did: Did, keypair: Keypair) -> Self {
        Self { did, keypair }
    }

    pub fn verkey(&self) -> VerifyingKey {
        self.keypair.public()
    }
}

impl Debug for Me {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Me")
            .field("did", &self.did)
            .field("verkey", &verkey_to_base64(&self.verkey()))
            .finish()
    }
}

/// The remote end of a relationship: enough to address messages to a peer.
#[derive(Clone, PartialEq, Eq)]
pub struct Their {
    pub did: Did,
    pub verkey: VerifyingKey,
    pub endpoint: String,
    pub routing_keys: Vec<VerifyingKey>,
}

impl Their {
    pub fn new(did: Did, verkey: VerifyingKey, endpoint: impl Into<String>) -> Self {
        Self {
            did,
            verkey,
            endpoint: endpoint.into(),
            routing_keys: Vec::new(),
        }
    }
}

impl Debug for Their {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Their")
            .field("did", &self.did)
            .field("verkey", &verkey_to_base64(&self.verkey))
            .field("endpoint", &self.endpoint)
            .field("routing_keys", &self.routing_keys.len())
            .finish()
    }
}

/// A DID-to-DID relationship record. Immutable for the lifetime of any coprotocol that uses it.
#[derive(Clone, Debug)]
pub struct Pairwise {
    pub me: Me,
    pub their: Their,
}

impl Pairwise {
    pub fn new(me: Me, their: Their) -> Self {
        Self { me, their }
    }
}

/// The set of peers a party knows how to reach, indexed by DID.
///
/// Consensus state machines resolve participant DIDs through a `Directory`, and use it to check that a
/// signature attributed to a participant was made with that participant's known key.
#[derive(Clone, Debug, Default)]
pub struct Directory {
    peers: BTreeMap<Did, Their>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `their`, replacing any previous entry for the same DID.
    pub fn insert(&mut self, their: Their) {
        self.peers.insert(their.did.clone(), their);
    }

    pub fn get(&self, did: &Did) -> Option<&Their> {
        self.peers.get(did)
    }

    pub fn find_by_verkey(&self, verkey: &VerifyingKey) -> Option<&Their> {
        self.peers.values().find(|their| their.verkey == *verkey)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Their> {
        self.peers.values()
    }
}

impl FromIterator<Their> for Directory {
    fn from_iter<I: IntoIterator<Item = Their>>(iter: I) -> Self {
        let mut directory = Directory::new();
        for their in iter {
            directory.insert(their);
        }
        directory
    }
}
