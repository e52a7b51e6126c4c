// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Mailroom receiver
//!
//! Inbound message handling for capability containers. A process binds one or more `Receiver`s
//! to broker mailboxes; each receiver consumes its mailbox, runs every delivery through an
//! interceptor chain and the registered handlers, and keeps exact bookkeeping of what is in
//! flight so it can be taken out of rotation without losing work.
//!
//! ## Overview
//!
//! - **Mailbox handles** turn a plain name and a `Scope` into the broker-visible scoped name.
//! - **Topologies** (`Exclusive`, `SharedWork`, `Fanout`) decide how a mailbox is declared on the
//!   broker. The state machine and pipeline are the same for all of them.
//! - **Receivers** admit each message once, open its conversation scope, run the handlers and
//!   release it. `deactivate()` drains in-flight messages, bounded by a timeout.
//! - **Conversation context** is a per-process stack of open conversation ids shared by every
//!   receiver of the process, with per-conversation caches cleared when a conversation closes.
//! - **Service processes** sequence business hooks around a receiver so that teardown never
//!   races in-flight handlers.
//!
//! ## Getting Started
//!
//! ```ignore
//! use receiver::{
//!     Envelope, Error, MailboxHandle, MemoryBroker, MessageHandler, Process, Receiver,
//!     RequestContext, Scope, SharedWork, SystemId, INFORM_RESULT,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Adder;
//!
//! #[async_trait]
//! impl MessageHandler for Adder {
//!     async fn handle(
//!         &self,
//!         content: &[u8],
//!         _message: &Envelope,
//!         ctx: &RequestContext,
//!     ) -> Result<(), Error> {
//!         let sum: u32 = content.iter().map(|b| *b as u32).sum();
//!         ctx.reply(INFORM_RESULT, sum.to_string().as_bytes()).await?;
//!         Ok(())
//!     }
//! }
//!
//! let process = Process::new("worker-1", SystemId::new("prod", "container-a"));
//! let mailbox = MailboxHandle::new("adder", Scope::System, process.system())?;
//! let receiver = Receiver::builder("adder", mailbox, SharedWork)
//!     .build(&process, Arc::new(MemoryBroker::new()));
//! receiver.add_handler(Adder);
//! let scoped = receiver.attach().await?;
//! ```
//!

mod admission;
mod config;
mod context;
mod envelope;
mod error;
mod handler;
mod interceptor;
mod lifecycle;
mod mailbox;
mod memory;
mod process;
mod receiver;
mod retry;
mod sink;
mod topology;
mod transport;

//
// Addressing
//

/// Mailbox identity and the scoped name the broker knows it by.
pub use mailbox::{MailboxHandle, Scope, SystemId};

/// Mailbox layouts on the broker.
///
/// See [`MailboxTopology`] to plug in a layout of your own.
pub use topology::{
    DIRECT_EXCHANGE, Declaration, ExchangeKind, Exclusive, Fanout, MailboxTopology, SharedWork,
};

//
// Messages
//

/// Wire envelope and message identity.
pub use envelope::{
    Envelope, MessageId, REQUEST, RESULT_PERFORMATIVES, RPC_PROTOCOL, ScopeRule,
};

//
// Receivers
//

/// Message receiver, its builder and its lifecycle states.
///
/// See the [`receiver`](crate::Receiver) documentation for the state table.
pub use receiver::{Receiver, ReceiverBuilder, ReceiverState};

/// Handler traits and the per-message context handed to them.
pub use handler::{
    ErrorHandler, FAILURE, INFORM_RESULT, MessageHandler, Outbox, Rejection, ReplyOnReject,
    RequestContext, STATUS_CODE,
};

/// Interceptor chain run on every inbound and outbound message.
pub use interceptor::{Direction, Interceptor, InterceptorChain, Invocation, InvocationStatus};

/// Bounded history of admitted message identities.
pub use admission::AdmissionLog;

/// Receiver tunables.
pub use config::ReceiverConfig;

//
// Processes
//

/// Owning process of a set of receivers.
pub use process::{Process, ProcessFault};

/// Conversation context stack and caches shared by the receivers of a process.
pub use context::{ConversationCaches, ConversationContext, NO_CONVERSATION, Popped};

/// Business hooks sequenced around an inbound receiver.
pub use lifecycle::{Service, ServiceProcess};

//
// Broker
//

/// Broker boundary consumed by receivers.
pub use transport::{
    Acknowledger, Consumer, Delivery, DeliveryReceiver, DeliverySender, MailboxConfig,
    Settlement, Transport,
};

/// In-process broker.
pub use memory::{MemoryBroker, MemoryConsumer};

/// Consumer open retries.
pub use retry::{
    ExponentialBackoffStrategy, FixedIntervalStrategy, NoIntervalStrategy, RetryStrategy,
};

//
// Errors and faults
//

pub use error::Error;

/// Fault event forwarding.
///
/// See [`ProcessFault`] and [`Process::subscribe_faults`].
pub use sink::{Event, Sink, Subscriber};
