/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Unencrypted packing, for tests and trusted in-process deployments.
//!
//! A packed message is the JSON object
//!
//! ```text
//! { "protected": { "sender": "<base64 verkey>" | null, "recipients": ["<base64 verkey>", ...] }, "message": { ... } }
//! ```
//!
//! Nothing is encrypted or signed. The first recipient is reported as the recipient on unpack.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    messages::envelope::Envelope,
    types::crypto_primitives::{verkey_from_base64, verkey_to_base64, VerifyingKey},
};

use super::{CryptoError, Inbound, MessageCrypto};

#[derive(Clone, Copy, Debug, Default)]
pub struct PlaintextCrypto;

#[derive(Serialize, Deserialize)]
struct Protected {
    sender: Option<String>,
    recipients: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct Packed {
    protected: Protected,
    message: Value,
}

impl MessageCrypto for PlaintextCrypto {
    fn pack(
        &self,
        message: &Envelope,
        recipient_keys: &[VerifyingKey],
        sender_key: Option<&VerifyingKey>,
    ) -> Result<Vec<u8>, CryptoError> {
        if recipient_keys.is_empty() {
            return Err(CryptoError::NoRecipients);
        }
        let packed = Packed {
            protected: Protected {
                sender: sender_key.map(verkey_to_base64),
                recipients: recipient_keys.iter().map(verkey_to_base64).collect(),
            },
            message: message.to_value()?,
        };
        Ok(serde_json::to_vec(&packed)?)
    }

    fn unpack(&self, packed: &[u8]) -> Result<Inbound, CryptoError> {
        let packed: Packed = serde_json::from_slice(packed)?;
        let recipient = packed
            .protected
            .recipients
            .first()
            .ok_or(CryptoError::NoRecipients)?;
        Ok(Inbound {
            message: Envelope::from_value(packed.message)?,
            sender_verkey: packed
                .protected
                .sender
                .as_deref()
                .map(verkey_from_base64)
                .transpose()?,
            recipient_verkey: verkey_from_base64(recipient)?,
        })
    }
}
