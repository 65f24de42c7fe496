/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signed message fields.
//!
//! A [`SignedField`] carries some JSON `data`, the verification key of its `signer`, and an Ed25519
//! signature by that signer over the exact JSON bytes of `data`. Consensus messages use signed fields to
//! prove that a particular participant vouched for a particular ledger state.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::crypto_primitives::{
    verkey_from_base64, verkey_to_base64, KeyDecodeError, Keypair, Signature, Verifier,
    VerifyingKey,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedField {
    /// Base64 of the signer's verification key.
    pub signer: String,
    /// Base64 of the signed JSON bytes.
    pub sig_data: String,
    /// Base64 of the 64 signature bytes.
    pub signature: String,
}

impl SignedField {
    /// Serialize `data` to JSON and sign the resulting bytes with `keypair`.
    pub fn sign<T: Serialize>(keypair: &Keypair, data: &T) -> Result<SignedField, SignedFieldError> {
        let bytes = serde_json::to_vec(data)?;
        let signature = keypair.sign(&bytes);
        Ok(SignedField {
            signer: verkey_to_base64(&keypair.public()),
            sig_data: STANDARD.encode(&bytes),
            signature: STANDARD.encode(signature.to_bytes()),
        })
    }

    /// Get the verification key of the signer named in this field. This does **not** check the signature.
    pub fn signer(&self) -> Result<VerifyingKey, SignedFieldError> {
        Ok(verkey_from_base64(&self.signer)?)
    }

    /// Check that `signature` was made by `signer` over `sig_data`, and return the signer's key.
    pub fn verify(&self) -> Result<VerifyingKey, SignedFieldError> {
        let signer = self.signer()?;
        let bytes = STANDARD
            .decode(&self.sig_data)
            .map_err(|_| SignedFieldError::Encoding("sig_data"))?;
        let signature_bytes: [u8; 64] = STANDARD
            .decode(&self.signature)
            .map_err(|_| SignedFieldError::Encoding("signature"))?
            .try_into()
            .map_err(|_| SignedFieldError::Encoding("signature"))?;
        let signature = Signature::from_bytes(&signature_bytes);
        signer
            .verify(&bytes, &signature)
            .map_err(|_| SignedFieldError::InvalidSignature)?;
        Ok(signer)
    }

    /// Check that this field verifies **and** was signed by `expected`.
    pub fn verify_signed_by(&self, expected: &VerifyingKey) -> Result<(), SignedFieldError> {
        let signer = self.verify()?;
        if signer != *expected {
            return Err(SignedFieldError::UnexpectedSigner(self.signer.clone()));
        }
        Ok(())
    }

    /// Deserialize the signed data. This does **not** check the signature.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, SignedFieldError> {
        let bytes = STANDARD
            .decode(&self.sig_data)
            .map_err(|_| SignedFieldError::Encoding("sig_data"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignedFieldError {
    #[error("field `{0}` of the signed field is not valid base64")]
    Encoding(&'static str),
    #[error(transparent)]
    Key(#[from] KeyDecodeError),
    #[error("signed data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signature does not match the signed data")]
    InvalidSignature,
    #[error("field was signed by unexpected key {0}")]
    UnexpectedSigner(String),
}
