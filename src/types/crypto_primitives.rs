/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate.
//! 2. **Digital Signatures**: provided by the [`ed25519_dalek`] crate.
//!
//! Verification keys travel inside JSON messages and bus frames. Their textual form is standard,
//! padded base64 of the 32 key bytes; see [`verkey_to_base64`] and [`verkey_from_base64`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::OsRng;

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};

use super::data_types::CryptoHash;

/// A facade around [`SigningKey`] that implements method for [`sign`](Self::sign)-ing messages as well
/// as a getter for the [`public`](Self::public) key associated with the signing key.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    /// Create a `Keypair` that wraps over `signing_key`.
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Generate a fresh `Keypair` from the operating system's random number generator.
    pub fn generate() -> Keypair {
        Keypair(SigningKey::generate(&mut OsRng))
    }

    /// Sign an arbitrary `message` with the `Keypair`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.0.sign(message)
    }

    /// Get the `VerifyingKey` of this `Keypair`.
    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

/// Hash `bytes` with [`CryptoHasher`].
pub fn hash(bytes: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update(bytes);
    CryptoHash::new(hasher.finalize().into())
}

/// Base64 text form of `verkey`.
pub fn verkey_to_base64(verkey: &VerifyingKey) -> String {
    STANDARD.encode(verkey.as_bytes())
}

/// Parse the base64 text form of a verification key.
pub fn verkey_from_base64(text: &str) -> Result<VerifyingKey, KeyDecodeError> {
    let decoded = STANDARD
        .decode(text)
        .map_err(|_| KeyDecodeError::NotBase64(text.to_string()))?;
    let bytes: [u8; 32] = decoded
        .try_into()
        .map_err(|_| KeyDecodeError::WrongLength(text.to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| KeyDecodeError::NotOnCurve(text.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyDecodeError {
    #[error("verification key `{0}` is not valid base64")]
    NotBase64(String),
    #[error("verification key `{0}` does not decode to 32 bytes")]
    WrongLength(String),
    #[error("verification key `{0}` is not a valid ed25519 point")]
    NotOnCurve(String),
}

/// `#[serde(with = "verkey_serde")]` helper for `VerifyingKey` fields.
pub mod verkey_serde {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::{verkey_from_base64, verkey_to_base64, VerifyingKey};

    pub fn serialize<S: Serializer>(verkey: &VerifyingKey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&verkey_to_base64(verkey))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<VerifyingKey, D::Error> {
        let text = String::deserialize(deserializer)?;
        verkey_from_base64(&text).map_err(de::Error::custom)
    }
}

/// `#[serde(with = "verkeys_serde")]` helper for `Vec<VerifyingKey>` fields.
pub mod verkeys_serde {
    use serde::{de, Deserialize, Deserializer, Serializer, ser::SerializeSeq};

    use super::{verkey_from_base64, verkey_to_base64, VerifyingKey};

    pub fn serialize<S: Serializer>(
        verkeys: &[VerifyingKey],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(verkeys.len()))?;
        for verkey in verkeys {
            seq.serialize_element(&verkey_to_base64(verkey))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<VerifyingKey>, D::Error> {
        let texts = Vec::<String>::deserialize(deserializer)?;
        texts
            .iter()
            .map(|text| verkey_from_base64(text).map_err(de::Error::custom))
            .collect()
    }
}
