/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Message envelopes and typed message bodies.
//!
//! Every message exchanged by the crate travels as an [`Envelope`](envelope::Envelope). Typed message
//! kinds are plain `serde` structs implementing [`TypedMessage`], which maps a body to and from the payload
//! fields of an envelope of the right `@type`. Anything the crate does not recognize stays a generic
//! envelope; see [`ConsensusMessage`](crate::consensus::messages::ConsensusMessage) for the tagged union
//! used by the consensus state machines.

pub mod envelope;

pub mod message_type;

pub mod notifications;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use envelope::{Envelope, EnvelopeError};
use message_type::{MessageType, DIDCOMM_DOC_URI};

/// A message body with a fixed `(protocol, version, name)` triple.
pub trait TypedMessage: Serialize + DeserializeOwned {
    const PROTOCOL: &'static str;
    const VERSION: &'static str;
    const NAME: &'static str;

    fn message_type() -> MessageType {
        MessageType::new(DIDCOMM_DOC_URI, Self::PROTOCOL, Self::VERSION, Self::NAME)
    }

    /// Whether `envelope` carries a body of this type.
    fn matches(envelope: &Envelope) -> bool {
        envelope.msg_type().same_message(&Self::message_type())
    }

    /// Wrap this body into a new envelope with a fresh `@id`.
    fn to_envelope(&self) -> Result<Envelope, EnvelopeError> {
        match serde_json::to_value(self)? {
            Value::Object(fields) => Ok(Envelope::from_parts(Self::message_type(), fields)),
            _ => Ok(Envelope::new(Self::message_type())),
        }
    }

    /// Read this body out of `envelope`.
    fn from_envelope(envelope: &Envelope) -> Result<Self, EnvelopeError> {
        if !Self::matches(envelope) {
            return Err(EnvelopeError::UnexpectedType {
                expected: Self::message_type().to_string(),
                actual: envelope.msg_type().to_string(),
            });
        }
        Ok(serde_json::from_value(Value::Object(
            envelope.fields().clone(),
        ))?)
    }
}
