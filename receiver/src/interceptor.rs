// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Interceptor chain boundary
//!
//! Interceptors are the cross-cutting policies (security, decoding, routing) applied to every
//! message entering or leaving a process. Their logic lives elsewhere; the receiver only relies
//! on the contract below: an invocation goes in, a possibly transformed invocation comes out with
//! a status of `Process`, `Drop` or `Reject`.
//!

use crate::{envelope::Envelope, process::Process};

use async_trait::async_trait;

use tracing::debug;

use std::sync::{Arc, Weak};

/// Direction of a message relative to the process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Verdict of the interceptor chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InvocationStatus {
    /// Hand the message on.
    Process,
    /// Discard the message silently.
    Drop,
    /// Refuse the message; error handlers are told why.
    Reject { code: u16, reason: String },
}

/// A message travelling through the interceptor chain.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub direction: Direction,
    pub message: Envelope,
    /// Payload as seen by handlers. Interceptors may replace it (decoding, decryption).
    pub content: Vec<u8>,
    pub process: Weak<Process>,
    pub status: InvocationStatus,
}

impl Invocation {
    /// Creates an invocation whose content is the message payload.
    pub fn new(direction: Direction, message: Envelope, process: Weak<Process>) -> Self {
        let content = message.content.clone();
        Self {
            direction,
            message,
            content,
            process,
            status: InvocationStatus::Process,
        }
    }
}

/// One policy of the chain.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn process(&self, invocation: Invocation) -> Invocation;
}

/// Ordered inbound and outbound interceptor stacks. An empty chain lets everything through.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    inbound: Vec<Arc<dyn Interceptor>>,
    outbound: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an interceptor to the inbound stack.
    pub fn with_inbound(mut self, interceptor: impl Interceptor) -> Self {
        self.inbound.push(Arc::new(interceptor));
        self
    }

    /// Appends an interceptor to the outbound stack.
    pub fn with_outbound(mut self, interceptor: impl Interceptor) -> Self {
        self.outbound.push(Arc::new(interceptor));
        self
    }

    /// Runs the stack matching the invocation direction, stopping at the first interceptor that
    /// does not answer `Process`.
    pub async fn run(&self, mut invocation: Invocation) -> Invocation {
        let stack = match invocation.direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        };
        for interceptor in stack {
            invocation = interceptor.process(invocation).await;
            if invocation.status != InvocationStatus::Process {
                debug!(
                    "Interceptor chain stopped {:?} message with {:?}.",
                    invocation.direction, invocation.status
                );
                break;
            }
        }
        invocation
    }
}
