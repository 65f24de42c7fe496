/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or strings, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Decentralized identifier of a party, e.g., `did:peer:Th7MpTaRZVRYnPiabds81Y`.
///
/// Participants of consensus rounds and the two ends of a [`Pairwise`](super::pairwise::Pairwise) are
/// identified by their `Did`. The crate does not resolve DIDs; it only compares them.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    /// Create a new `Did` wrapping `did`.
    pub fn new(did: impl Into<String>) -> Self {
        Self(did.into())
    }

    /// Get the string form of this `Did`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Did {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for Did {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl From<&str> for Did {
    fn from(value: &str) -> Self {
        Did::new(value)
    }
}

/// Content fingerprint of a set of ledger transactions: a SHA-256 digest.
///
/// The textual form (used in JSON messages and in logs) is standard, padded base64.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner bytes of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Get the base64 text form of this `CryptoHash`.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl FromStr for CryptoHash {
    type Err = CryptoHashDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = STANDARD
            .decode(s)
            .map_err(|_| CryptoHashDecodeError(s.to_string()))?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| CryptoHashDecodeError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoHash({})", self.to_base64())
    }
}

impl Serialize for CryptoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for CryptoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <String as Deserialize>::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// The text was not the base64 encoding of exactly 32 bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{0}` is not a base64-encoded 32-byte hash")]
pub struct CryptoHashDecodeError(String);
