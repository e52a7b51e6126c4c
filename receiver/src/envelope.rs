// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Message envelope
//!
//! The envelope is what crosses the broker. Its header fields must survive the outbound and
//! inbound interceptor pair byte for byte, so the wire form is a plain `bincode` encoding of the
//! struct.
//!

use crate::Error;

use serde::{Deserialize, Serialize};

use std::{collections::BTreeMap, fmt};

/// Protocol name of request/response traffic.
pub const RPC_PROTOCOL: &str = "rpc";

/// Performative of an RPC request.
pub const REQUEST: &str = "request";

/// Performatives that carry an RPC result back to the requester.
pub const RESULT_PERFORMATIVES: [&str; 3] = ["inform-result", "result", "failure"];

/// Identity of a message, used for duplicate detection.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: &str) -> Self {
        Self(id.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        MessageId::new(id)
    }
}

/// How a message affects the conversation context stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScopeRule {
    /// One-way message or RPC request: opens a scope for its `conv-id`.
    Open,
    /// RPC result: delivered inside the requester's already open scope.
    Inherit,
    /// RPC message with an unrecognized performative: the stack is left alone and the current
    /// top of the stack (or a sentinel) stands in for the conversation.
    Fallback,
}

/// Message envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Identity assigned by the sender.
    pub message_id: Option<MessageId>,
    pub sender: Option<String>,
    pub receiver: String,
    pub op: Option<String>,
    pub conv_id: Option<String>,
    pub protocol: Option<String>,
    pub performative: Option<String>,
    pub encoding: Option<String>,
    /// Headers not covered by the fields above.
    pub headers: BTreeMap<String, String>,
    pub content: Vec<u8>,
}

impl Envelope {
    /// Creates an envelope addressed to `receiver`.
    pub fn new(receiver: &str) -> Self {
        Self {
            receiver: receiver.to_owned(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.message_id = Some(MessageId::new(id));
        self
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_owned());
        self
    }

    pub fn with_op(mut self, op: &str) -> Self {
        self.op = Some(op.to_owned());
        self
    }

    pub fn with_conversation(mut self, conv_id: &str) -> Self {
        self.conv_id = Some(conv_id.to_owned());
        self
    }

    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = Some(protocol.to_owned());
        self
    }

    pub fn with_performative(mut self, performative: &str) -> Self {
        self.performative = Some(performative.to_owned());
        self
    }

    pub fn with_encoding(mut self, encoding: &str) -> Self {
        self.encoding = Some(encoding.to_owned());
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_content(mut self, content: &[u8]) -> Self {
        self.content = content.to_vec();
        self
    }

    /// Shorthand for an RPC request.
    pub fn request(receiver: &str, op: &str, conv_id: &str) -> Self {
        Envelope::new(receiver)
            .with_op(op)
            .with_conversation(conv_id)
            .with_protocol(RPC_PROTOCOL)
            .with_performative(REQUEST)
    }

    /// Whether this is an RPC request.
    pub fn is_request(&self) -> bool {
        self.protocol.as_deref() == Some(RPC_PROTOCOL)
            && self.performative.as_deref() == Some(REQUEST)
    }

    /// Classifies the message for conversation context bookkeeping.
    pub fn scope_rule(&self) -> ScopeRule {
        if self.protocol.as_deref() != Some(RPC_PROTOCOL) {
            return ScopeRule::Open;
        }
        match self.performative.as_deref() {
            Some(REQUEST) => ScopeRule::Open,
            Some(p) if RESULT_PERFORMATIVES.contains(&p) => ScopeRule::Inherit,
            _ => ScopeRule::Fallback,
        }
    }

    /// Encodes the envelope in its wire form.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes an envelope from its wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(bincode::deserialize(bytes)?)
    }
}
