/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Frames exchanged between a [`RemoteBus`](super::remote::RemoteBus) and a
//! [`BusServer`](super::server::BusServer).
//!
//! On the wire every frame is a little-endian `u32` length followed by that many bytes of the frame's
//! borsh serialization.

use borsh::{BorshDeserialize, BorshSerialize};

/// Requests carry a `request_id` chosen by the client, and the server echoes it in the response (or
/// `ProblemReport`) it answers with. `UnsubscribeRequest` gets no response, and `Event`s are pushed by the
/// server unprompted.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Frame {
    SubscribeRequest {
        request_id: u64,
        thread_ids: Vec<String>,
    },
    SubscribeByFilterRequest {
        request_id: u64,
        sender_keys: Vec<[u8; 32]>,
        recipient_keys: Vec<[u8; 32]>,
        protocols: Vec<String>,
    },
    BindResponse {
        request_id: u64,
        binding_ids: Vec<String>,
    },
    UnsubscribeRequest {
        thread_ids: Vec<String>,
    },
    PublishRequest {
        request_id: u64,
        thread_id: String,
        payload: Vec<u8>,
    },
    PublishResponse {
        request_id: u64,
        recipients: u64,
    },
    Event {
        thread_id: String,
        payload: Vec<u8>,
    },
    ProblemReport {
        request_id: u64,
        problem_code: String,
        explain: String,
    },
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::SubscribeRequest { .. } => "SubscribeRequest",
            Frame::SubscribeByFilterRequest { .. } => "SubscribeByFilterRequest",
            Frame::BindResponse { .. } => "BindResponse",
            Frame::UnsubscribeRequest { .. } => "UnsubscribeRequest",
            Frame::PublishRequest { .. } => "PublishRequest",
            Frame::PublishResponse { .. } => "PublishResponse",
            Frame::Event { .. } => "Event",
            Frame::ProblemReport { .. } => "ProblemReport",
        }
    }

    /// The id of the request this frame is, or answers.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::SubscribeRequest { request_id, .. }
            | Frame::SubscribeByFilterRequest { request_id, .. }
            | Frame::BindResponse { request_id, .. }
            | Frame::PublishRequest { request_id, .. }
            | Frame::PublishResponse { request_id, .. }
            | Frame::ProblemReport { request_id, .. } => Some(*request_id),
            Frame::UnsubscribeRequest { .. } | Frame::Event { .. } => None,
        }
    }
}

pub const PROBLEM_INVALID_KEY: &str = "invalid_key";
pub const PROBLEM_UNEXPECTED_FRAME: &str = "unexpected_frame";
