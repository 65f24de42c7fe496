/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable outbound message delivery.
//!
//! Getting a message to a peer takes two capabilities, both supplied by the user of the crate through
//! its [`Context`](crate::context::Context):
//! 1. [`MessageCrypto`] packs an [`Envelope`] for a set of recipient keys into opaque bytes, and unpacks
//!    such bytes back into an [`Inbound`] message.
//! 2. [`Transport`] moves packed bytes to a peer's endpoint.
//!
//! The crate ships a [`PlaintextCrypto`](plaintext::PlaintextCrypto) packer and an in-process
//! [`LocalNetwork`](local::LocalNetwork) transport, which together are enough to run agents inside one
//! process. Real deployments plug in an authenticated-encryption packer and a network transport.

pub mod local;

pub mod plaintext;

use std::fmt::{self, Debug, Formatter};

use crate::{
    messages::envelope::{Envelope, EnvelopeError},
    types::crypto_primitives::{verkey_to_base64, KeyDecodeError, VerifyingKey},
};

/// A message as it came out of [`MessageCrypto::unpack`].
#[derive(Clone)]
pub struct Inbound {
    pub message: Envelope,
    /// `None` if the message was packed anonymously.
    pub sender_verkey: Option<VerifyingKey>,
    pub recipient_verkey: VerifyingKey,
}

impl Debug for Inbound {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("message", &self.message)
            .field("sender_verkey", &self.sender_verkey.as_ref().map(verkey_to_base64))
            .field("recipient_verkey", &verkey_to_base64(&self.recipient_verkey))
            .finish()
    }
}

/// Message-level packing and unpacking.
pub trait MessageCrypto: Clone + Send + Sync + 'static {
    fn pack(
        &self,
        message: &Envelope,
        recipient_keys: &[VerifyingKey],
        sender_key: Option<&VerifyingKey>,
    ) -> Result<Vec<u8>, CryptoError>;

    fn unpack(&self, packed: &[u8]) -> Result<Inbound, CryptoError>;
}

/// Moves packed messages to a peer's endpoint.
pub trait Transport: Clone + Send + 'static {
    /// Deliver `packed` to `endpoint`, through the mediators named by `routing_keys` if there are any.
    fn send(
        &mut self,
        packed: Vec<u8>,
        endpoint: &str,
        routing_keys: &[VerifyingKey],
    ) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("packed message has no recipients")]
    NoRecipients,
    #[error("packed message is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Key(#[from] KeyDecodeError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint {0} is unreachable")]
    Unreachable(String),
    #[error("endpoint {endpoint} rejected the message: {reason}")]
    Rejected { endpoint: String, reason: String },
}
