/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Acknowledgements and problem reports.

use serde::{Deserialize, Serialize};

use super::{
    envelope::{Envelope, EnvelopeError, Thread},
    TypedMessage,
};

pub const NOTIFICATION_PROTOCOL: &str = "notification";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub status: AckStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    Ok,
    Pending,
    Fail,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status: AckStatus::Ok,
        }
    }

    /// Build an envelope acknowledging `acked`: its thread id is the `message_id` of `acked`'s
    /// `~please_ack`, or `acked`'s own `@id` if it did not ask for one.
    pub fn acknowledging(acked: &Envelope) -> Result<Envelope, EnvelopeError> {
        let thid = acked
            .please_ack()
            .map(|please_ack| please_ack.message_id.clone())
            .unwrap_or_else(|| acked.id().to_string());
        let mut envelope = Self::ok().to_envelope()?;
        envelope.set_thread(Thread::new(thid))?;
        Ok(envelope)
    }
}

impl TypedMessage for Ack {
    const PROTOCOL: &'static str = NOTIFICATION_PROTOCOL;
    const VERSION: &'static str = "1.0";
    const NAME: &'static str = "ack";
}

/// Structured failure notification sent to the other participants of a protocol that is being aborted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    pub problem_code: String,
    pub explain: String,
}

impl ProblemReport {
    pub fn new(problem_code: impl Into<String>, explain: impl Into<String>) -> Self {
        Self {
            problem_code: problem_code.into(),
            explain: explain.into(),
        }
    }
}

impl TypedMessage for ProblemReport {
    const PROTOCOL: &'static str = NOTIFICATION_PROTOCOL;
    const VERSION: &'static str = "1.0";
    const NAME: &'static str = "problem-report";
}
