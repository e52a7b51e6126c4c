// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!
//! Fatal errors (duplicate admission, unresolvable mailbox, missing mailbox name, illegal lifecycle
//! transitions) abort the operation that raised them. Message-level outcomes (rejections, handler
//! failures) are reported on the owning process's fault channel and never stop the pipeline.
//!

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the receiver runtime.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A mailbox was declared with an empty name.
    #[error("Mailbox name is missing.")]
    MissingMailboxName,
    /// The broker has no configuration for the scoped mailbox name.
    #[error("Mailbox {0} can not be resolved.")]
    MailboxNotFound(String),
    /// A message identity was delivered twice to the same receiver.
    #[error("Message {0} was already admitted.")]
    DuplicateMessage(String),
    /// A lifecycle operation was attempted from a state that does not allow it.
    #[error("Can not {operation} a receiver in state {from}.")]
    InvalidTransition { from: String, operation: String },
    /// The broker transport failed.
    #[error("Transport error: {0}")]
    Transport(String),
    /// An envelope could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),
    /// A message handler returned an error.
    #[error("Handler error: {0}")]
    Handler(String),
    /// A message handler panicked.
    #[error("Handler panicked while processing message {0}.")]
    HandlerPanic(String),
    /// The inbound interceptor chain rejected a message.
    #[error("Message rejected with code {code}: {reason}")]
    Rejected { code: u16, reason: String },
    /// Deactivation gave up waiting for in-flight messages.
    #[error("Drain timed out, {abandoned} in-flight message(s) were cancelled.")]
    DrainTimeout { abandoned: usize },
    /// The process that owns the receiver no longer exists.
    #[error("The owning process is gone.")]
    ProcessGone,
    /// A service lifecycle hook failed.
    #[error("Service error: {0}")]
    Service(String),
    /// An error occurred while sending on an internal channel.
    #[error("An error occurred while sending: {0}.")]
    Send(String),
}

impl From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::Codec(error.to_string())
    }
}
