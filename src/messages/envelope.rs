/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The generic message envelope.
//!
//! ## Wire shape
//!
//! An [`Envelope`] is a JSON object whose field names are contractual:
//!
//! ```text
//! {
//!     "@type": "https://didcomm.org/simple-consensus/1.0/stage-propose",
//!     "@id": "0b5e...",
//!     "~thread": { "thid": "...", "pthid": "...", "sender_order": 0, "received_orders": { "did:peer:a": 1 } },
//!     "~please_ack": { "message_id": "0b5e..." },
//!     ...payload fields...
//! }
//! ```
//!
//! Payload fields the crate does not know about are kept in a side-map and written back unchanged, so
//! an envelope survives a decode/encode cycle field-for-field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::message_type::{MessageType, MessageTypeError};

/// Generate a fresh, unique message or thread identifier.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// The `~thread` decorator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub thid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_order: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub received_orders: BTreeMap<String, u64>,
}

impl Thread {
    pub fn new(thid: impl Into<String>) -> Self {
        Self {
            thid: thid.into(),
            pthid: None,
            sender_order: None,
            received_orders: BTreeMap::new(),
        }
    }
}

/// The `~please_ack` decorator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PleaseAck {
    pub message_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "@type")]
    msg_type: MessageType,

    #[serde(rename = "@id", default = "generate_id")]
    id: String,

    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    thread: Option<Thread>,

    #[serde(rename = "~please_ack", default, skip_serializing_if = "Option::is_none")]
    please_ack: Option<PleaseAck>,

    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Envelope {
    /// Create an empty envelope of type `msg_type` with a freshly generated `@id`.
    pub fn new(msg_type: MessageType) -> Self {
        Self::from_parts(msg_type, Map::new())
    }

    /// Create an envelope of type `msg_type` carrying the payload `fields`, with a freshly generated
    /// `@id`. Decorator keys (`@...` and `~...`) in `fields` are ignored.
    pub fn from_parts(msg_type: MessageType, mut fields: Map<String, Value>) -> Self {
        fields.retain(|key, _| !is_reserved(key));
        Self {
            msg_type,
            id: generate_id(),
            thread: None,
            please_ack: None,
            fields,
        }
    }

    pub fn msg_type(&self) -> &MessageType {
        &self.msg_type
    }

    /// The `@id` of this envelope. It never changes once the envelope is created.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn thread(&self) -> Option<&Thread> {
        self.thread.as_ref()
    }

    /// Shorthand for the `thid` of the `~thread` decorator.
    pub fn thread_id(&self) -> Option<&str> {
        self.thread.as_ref().map(|thread| thread.thid.as_str())
    }

    /// Attach or replace the `~thread` decorator.
    ///
    /// # Errors
    ///
    /// `thid` must differ from this envelope's `@id`, and `pthid`, if present, must differ from both.
    pub fn set_thread(&mut self, thread: Thread) -> Result<(), EnvelopeError> {
        check_thread(&self.id, &thread)?;
        self.thread = Some(thread);
        Ok(())
    }

    pub fn please_ack(&self) -> Option<&PleaseAck> {
        self.please_ack.as_ref()
    }

    /// Ask (`true`) or stop asking (`false`) the recipient to acknowledge this message.
    pub fn set_please_ack(&mut self, please_ack: bool) {
        self.please_ack = please_ack.then(|| PleaseAck {
            message_id: self.id.clone(),
        });
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Set payload field `name`. Decorator keys (`@...` and `~...`) are rejected.
    pub fn set_field(&mut self, name: &str, value: Value) -> Result<(), EnvelopeError> {
        if is_reserved(name) {
            return Err(EnvelopeError::ReservedField(name.to_string()));
        }
        self.fields.insert(name.to_string(), value);
        Ok(())
    }

    /// Check the thread-id invariants of an envelope that was decoded rather than built.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.id.is_empty() {
            return Err(EnvelopeError::MissingId);
        }
        if let Some(thread) = &self.thread {
            check_thread(&self.id, thread)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn to_value(&self) -> Result<Value, EnvelopeError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Envelope, EnvelopeError> {
        let envelope: Envelope = serde_json::from_value(value)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

fn is_reserved(key: &str) -> bool {
    key.starts_with('@') || key.starts_with('~')
}

fn check_thread(id: &str, thread: &Thread) -> Result<(), EnvelopeError> {
    if thread.thid.is_empty() {
        return Err(EnvelopeError::MissingThreadId);
    }
    if thread.thid == id {
        return Err(EnvelopeError::ThreadIdCollision(thread.thid.clone()));
    }
    if let Some(pthid) = &thread.pthid {
        if *pthid == id || *pthid == thread.thid {
            return Err(EnvelopeError::ThreadIdCollision(pthid.clone()));
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope has an empty @id")]
    MissingId,
    #[error("~thread decorator has an empty thid")]
    MissingThreadId,
    #[error("thread identifier {0} collides with another identifier of the same envelope")]
    ThreadIdCollision(String),
    #[error("field `{0}` is reserved for decorators")]
    ReservedField(String),
    #[error("expected a {expected} message, got {actual}")]
    UnexpectedType { expected: String, actual: String },
    #[error(transparent)]
    MessageType(#[from] MessageTypeError),
    #[error("envelope is not valid JSON for its type: {0}")]
    Json(#[from] serde_json::Error),
}
