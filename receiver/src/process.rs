// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Process
//!
//! The `Process` is the unit receivers are bound to. It owns what every receiver of the process
//! shares: the system identifier, the emergency shutoff flag, the conversation context stack, the
//! conversation caches and the fault channel. Receivers only keep a weak reference to it.
//!

use crate::{
    Error,
    context::{ConversationCaches, ConversationContext},
    envelope::MessageId,
    mailbox::SystemId,
    sink::Event,
};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use tracing::{error, warn};

use std::sync::Arc;

/// Error raised while a process was handling traffic.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessFault {
    /// Label of the receiver that hit the error.
    pub receiver: String,
    /// Message being processed, if any.
    pub message: Option<MessageId>,
    pub error: Error,
}

impl Event for ProcessFault {}

/// A long-running process hosting one or more receivers.
#[derive(Debug)]
pub struct Process {
    id: String,
    system: SystemId,
    shutoff: CancellationToken,
    contexts: ConversationContext,
    caches: ConversationCaches,
    faults: broadcast::Sender<ProcessFault>,
}

impl Process {
    /// Creates a process with its own shutoff flag.
    pub fn new(id: &str, system: SystemId) -> Arc<Self> {
        Self::with_shutoff(id, system, CancellationToken::new())
    }

    /// Creates a process whose shutoff flag is `token`, so that several processes can be shut
    /// off together.
    pub fn with_shutoff(id: &str, system: SystemId, token: CancellationToken) -> Arc<Self> {
        let (faults, _) = broadcast::channel(1000);
        Arc::new(Self {
            id: id.to_owned(),
            system,
            shutoff: token,
            contexts: ConversationContext::new(),
            caches: ConversationCaches::new(),
            faults,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn system(&self) -> &SystemId {
        &self.system
    }

    /// The conversation context stack shared by the receivers of this process.
    pub fn contexts(&self) -> &ConversationContext {
        &self.contexts
    }

    pub fn caches(&self) -> &ConversationCaches {
        &self.caches
    }

    /// Emergency stop: from now on every delivery is acknowledged and dropped unprocessed.
    pub fn shutoff(&self) {
        warn!("Process {} is shut off, incoming messages will be dropped.", self.id);
        self.shutoff.cancel();
    }

    pub fn is_shut_off(&self) -> bool {
        self.shutoff.is_cancelled()
    }

    /// Subscribes to the faults raised by this process.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<ProcessFault> {
        self.faults.subscribe()
    }

    /// Reports a fault: it is logged and broadcast to fault subscribers.
    pub(crate) fn report(&self, fault: ProcessFault) {
        match &fault.message {
            Some(id) => error!(
                "Process {} receiver {} failed on message {}: {}",
                self.id, fault.receiver, id, fault.error
            ),
            None => error!(
                "Process {} receiver {} failed: {}",
                self.id, fault.receiver, fault.error
            ),
        }
        let _ = self.faults.send(fault);
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[tokio::test]
    async fn test_faults_are_broadcast() {
        let process = Process::new("p1", SystemId::new("test", "c1"));
        let mut faults = process.subscribe_faults();
        process.report(ProcessFault {
            receiver: "inbox".to_owned(),
            message: Some(MessageId::new("m1")),
            error: Error::Handler("boom".to_owned()),
        });
        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.error, Error::Handler("boom".to_owned()));
    }

    #[test]
    fn test_shared_shutoff() {
        let token = CancellationToken::new();
        let first = Process::with_shutoff("p1", SystemId::new("test", "c1"), token.clone());
        let second = Process::with_shutoff("p2", SystemId::new("test", "c1"), token);
        assert!(!second.is_shut_off());
        first.shutoff();
        assert!(second.is_shut_off());
        assert_eq!(first.system().sysname(), "test");
    }
}
