// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Mailbox topologies
//!
//! A receiver is parameterized by the way its mailbox is laid out on the broker. The three
//! strategies only differ in the `Declaration` they produce; the receiver state machine and the
//! message pipeline are shared.
//!

use crate::mailbox::MailboxHandle;

use serde::{Deserialize, Serialize};

use std::fmt::Debug;

/// Exchange used for point-to-point routing by scoped name.
pub const DIRECT_EXCHANGE: &str = "mailroom.direct";

/// Kind of broker exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ExchangeKind {
    /// Routes a message to the queues bound with its routing key.
    Direct,
    /// Routes a message to every bound queue.
    Fanout,
}

/// Queue, exchange and binding declaration for one mailbox.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,
    /// Only one consumer may be attached to the queue at a time.
    pub exclusive: bool,
    /// The queue outlives its consumers.
    pub durable: bool,
}

impl Declaration {
    /// Name a sender puts in `Envelope::receiver` to reach this queue.
    pub fn address(&self) -> &str {
        match self.kind {
            ExchangeKind::Direct => &self.routing_key,
            ExchangeKind::Fanout => &self.exchange,
        }
    }
}

/// Strategy deciding how a mailbox is declared on the broker.
pub trait MailboxTopology: Debug + Send + Sync + 'static {
    /// Short name used in logs.
    fn kind(&self) -> &'static str;

    /// Builds the declaration for `mailbox`. `instance` is unique per receiver instance and is
    /// used by topologies that need a private queue.
    fn declare(&self, mailbox: &MailboxHandle, instance: &str) -> Declaration;
}

/// Private inbox of a single process instance. Queue and routing key are qualified with the
/// instance, so processes reusing a mailbox name never share an inbox.
#[derive(Clone, Copy, Debug, Default)]
pub struct Exclusive;

impl MailboxTopology for Exclusive {
    fn kind(&self) -> &'static str {
        "exclusive"
    }

    fn declare(&self, mailbox: &MailboxHandle, instance: &str) -> Declaration {
        let private = format!("{}.{}", mailbox.scoped_name(), instance);
        Declaration {
            exchange: DIRECT_EXCHANGE.to_owned(),
            kind: ExchangeKind::Direct,
            queue: private.clone(),
            routing_key: private,
            exclusive: true,
            durable: false,
        }
    }
}

/// Work queue shared by every receiver bound under the same name. The broker hands each
/// message to exactly one of them.
#[derive(Clone, Copy, Debug, Default)]
pub struct SharedWork;

impl MailboxTopology for SharedWork {
    fn kind(&self) -> &'static str {
        "shared"
    }

    fn declare(&self, mailbox: &MailboxHandle, _instance: &str) -> Declaration {
        Declaration {
            exchange: DIRECT_EXCHANGE.to_owned(),
            kind: ExchangeKind::Direct,
            queue: mailbox.scoped_name().to_owned(),
            routing_key: mailbox.scoped_name().to_owned(),
            exclusive: false,
            durable: true,
        }
    }
}

/// Broadcast mailbox: every bound receiver gets its own queue and a copy of every message.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fanout;

impl MailboxTopology for Fanout {
    fn kind(&self) -> &'static str {
        "fanout"
    }

    fn declare(&self, mailbox: &MailboxHandle, instance: &str) -> Declaration {
        Declaration {
            exchange: mailbox.scoped_name().to_owned(),
            kind: ExchangeKind::Fanout,
            queue: format!("{}.{}", mailbox.scoped_name(), instance),
            routing_key: String::new(),
            exclusive: true,
            durable: false,
        }
    }
}
