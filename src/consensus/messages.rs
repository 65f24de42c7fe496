/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages of the `simple-consensus/1.0` protocol.
//!
//! ## Micro-ledger initialization
//!
//! ```text
//! initiator                                   acceptor
//!     | --- initialize-request (genesis, root) --> |
//!     | <-- initialize-response (signature) ------ |
//!     | --- initialize-commit (all signatures) --> |
//!     | <-- ack ---------------------------------- |
//!     | --- ack ---------------------------------> |
//! ```
//!
//! ## Three-phase commit
//!
//! ```text
//! leader                                      acceptor
//!     | --- stage-propose (txns, root) ----------> |
//!     | <-- stage-pre-commit (signature) --------- |
//!     | --- stage-commit (all pre-commits) ------> |
//!     | <-- stage-post-commit (signature) -------- |
//! ```
//!
//! Every signature is a [`SignedField`] over a [`LedgerClaim`]: the ledger's name and the root hash the
//! signer vouches for. Either side may answer with a `problem-report` instead.

use serde::{Deserialize, Serialize};

use crate::{
    ledger::Transaction,
    messages::{
        envelope::{Envelope, EnvelopeError},
        notifications::{Ack, ProblemReport},
        TypedMessage,
    },
    types::{
        crypto_primitives::{Keypair, VerifyingKey},
        data_types::{CryptoHash, Did},
        signed_field::{SignedField, SignedFieldError},
    },
};

pub const CONSENSUS_PROTOCOL: &str = "simple-consensus";
pub const CONSENSUS_VERSION: &str = "1.0";

/// What a participant vouches for when it signs a consensus message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerClaim {
    pub ledger: String,
    pub root_hash: CryptoHash,
}

impl LedgerClaim {
    pub fn new(ledger: impl Into<String>, root_hash: CryptoHash) -> Self {
        Self {
            ledger: ledger.into(),
            root_hash,
        }
    }

    pub fn sign(&self, keypair: &Keypair) -> Result<SignedField, SignedFieldError> {
        SignedField::sign(keypair, self)
    }

    /// Check that `signed` is a valid signature over this very claim, and return its signer.
    pub fn verify(&self, signed: &SignedField) -> Result<VerifyingKey, ClaimError> {
        let signer = signed.verify()?;
        let claimed: LedgerClaim = signed.data()?;
        if claimed != *self {
            return Err(ClaimError::Mismatch {
                expected: self.root_hash,
                actual: claimed.root_hash,
            });
        }
        Ok(signer)
    }

    /// Like [`verify`](Self::verify), and additionally require `expected` to be the signer.
    pub fn verify_signed_by(
        &self,
        signed: &SignedField,
        expected: &VerifyingKey,
    ) -> Result<(), ClaimError> {
        let signer = self.verify(signed)?;
        if signer != *expected {
            return Err(ClaimError::Signature(SignedFieldError::UnexpectedSigner(
                signed.signer.clone(),
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error(transparent)]
    Signature(#[from] SignedFieldError),
    #[error("signed claim is for root hash {actual}, expected {expected}")]
    Mismatch {
        expected: CryptoHash,
        actual: CryptoHash,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeRequest {
    pub ledger: String,
    pub genesis: Vec<Transaction>,
    pub root_hash: CryptoHash,
    pub participants: Vec<Did>,
    pub signature: SignedField,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeResponse {
    pub signature: SignedField,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeCommit {
    pub ledger: String,
    pub participants: Vec<Did>,
    pub signatures: Vec<SignedField>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePropose {
    pub ledger: String,
    pub transactions: Vec<Transaction>,
    pub uncommitted_root_hash: CryptoHash,
    pub participants: Vec<Did>,
    pub signature: SignedField,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePreCommit {
    pub signature: SignedField,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCommit {
    pub pre_commits: Vec<SignedField>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePostCommit {
    pub signature: SignedField,
}

macro_rules! consensus_message {
    ($message:ty, $name:literal) => {
        impl TypedMessage for $message {
            const PROTOCOL: &'static str = CONSENSUS_PROTOCOL;
            const VERSION: &'static str = CONSENSUS_VERSION;
            const NAME: &'static str = $name;
        }
    };
}

consensus_message!(InitializeRequest, "initialize-request");
consensus_message!(InitializeResponse, "initialize-response");
consensus_message!(InitializeCommit, "initialize-commit");
consensus_message!(StagePropose, "stage-propose");
consensus_message!(StagePreCommit, "stage-pre-commit");
consensus_message!(StageCommit, "stage-commit");
consensus_message!(StagePostCommit, "stage-post-commit");

/// Every message a consensus participant may receive.
#[derive(Clone, Debug, PartialEq)]
pub enum ConsensusMessage {
    InitializeRequest(InitializeRequest),
    InitializeResponse(InitializeResponse),
    InitializeCommit(InitializeCommit),
    StagePropose(StagePropose),
    StagePreCommit(StagePreCommit),
    StageCommit(StageCommit),
    StagePostCommit(StagePostCommit),
    Ack(Ack),
    ProblemReport(ProblemReport),
    /// Any message of another protocol, or of an unknown kind.
    Other(Envelope),
}

impl ConsensusMessage {
    /// Decode `envelope`.
    ///
    /// # Errors
    ///
    /// If `envelope` has the type of a known message but its body does not decode.
    pub fn parse(envelope: &Envelope) -> Result<ConsensusMessage, EnvelopeError> {
        let message = if InitializeRequest::matches(envelope) {
            Self::InitializeRequest(InitializeRequest::from_envelope(envelope)?)
        } else if InitializeResponse::matches(envelope) {
            Self::InitializeResponse(InitializeResponse::from_envelope(envelope)?)
        } else if InitializeCommit::matches(envelope) {
            Self::InitializeCommit(InitializeCommit::from_envelope(envelope)?)
        } else if StagePropose::matches(envelope) {
            Self::StagePropose(StagePropose::from_envelope(envelope)?)
        } else if StagePreCommit::matches(envelope) {
            Self::StagePreCommit(StagePreCommit::from_envelope(envelope)?)
        } else if StageCommit::matches(envelope) {
            Self::StageCommit(StageCommit::from_envelope(envelope)?)
        } else if StagePostCommit::matches(envelope) {
            Self::StagePostCommit(StagePostCommit::from_envelope(envelope)?)
        } else if Ack::matches(envelope) {
            Self::Ack(Ack::from_envelope(envelope)?)
        } else if ProblemReport::matches(envelope) {
            Self::ProblemReport(ProblemReport::from_envelope(envelope)?)
        } else {
            Self::Other(envelope.clone())
        };
        Ok(message)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::InitializeRequest(_) => InitializeRequest::NAME,
            Self::InitializeResponse(_) => InitializeResponse::NAME,
            Self::InitializeCommit(_) => InitializeCommit::NAME,
            Self::StagePropose(_) => StagePropose::NAME,
            Self::StagePreCommit(_) => StagePreCommit::NAME,
            Self::StageCommit(_) => StageCommit::NAME,
            Self::StagePostCommit(_) => StagePostCommit::NAME,
            Self::Ack(_) => Ack::NAME,
            Self::ProblemReport(_) => ProblemReport::NAME,
            Self::Other(envelope) => envelope.msg_type().name(),
        }
    }

    /// Whether this message opens a round (and should be handed to an acceptor).
    pub fn starts_round(&self) -> bool {
        matches!(self, Self::InitializeRequest(_) | Self::StagePropose(_))
    }
}
