// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Broker transport boundary
//!
//! The receiver consumes the broker through the `Transport` and `Consumer` traits. Any broker
//! client can sit behind them; `MemoryBroker` is the in-process implementation.
//!

use crate::{
    Error,
    envelope::{Envelope, MessageId},
    topology::Declaration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Resolved queue and binding data of a mailbox.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MailboxConfig {
    /// Scoped name of the mailbox the queue belongs to.
    pub scoped_name: String,
    pub declaration: Declaration,
}

/// Channel sender used by a consumer to hand deliveries to the receiver.
pub type DeliverySender = mpsc::UnboundedSender<Delivery>;

/// Channel receiver the receiver reads deliveries from.
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

/// Broker client.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Declares the exchange, queue and binding described by `declaration`. Declaring the same
    /// thing twice is a no-op.
    async fn declare(&self, declaration: &Declaration) -> Result<(), Error>;

    /// Looks up the configuration of a declared queue.
    ///
    /// # Errors
    ///
    /// Returns `Error::MailboxNotFound` if no queue with that name exists.
    ///
    async fn resolve(&self, scoped_name: &str, queue: &str) -> Result<MailboxConfig, Error>;

    /// Opens a consumer on the queue of `config`. Delivery starts with `Consumer::consume`.
    async fn open_consumer(&self, config: &MailboxConfig) -> Result<Box<dyn Consumer>, Error>;

    /// Routes an envelope to the mailbox named by its `receiver` field.
    async fn publish(&self, envelope: &Envelope) -> Result<(), Error>;
}

/// Broker-side subscription owned by one receiver.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Begins delivery into `deliveries`.
    async fn consume(&mut self, deliveries: DeliverySender) -> Result<(), Error>;

    /// Stops delivery. Messages already handed over stay unsettled until acked or requeued.
    async fn cancel(&mut self) -> Result<(), Error>;

    /// Releases the subscription.
    async fn close(&mut self) -> Result<(), Error>;
}

/// Outcome of a delivery reported back to the broker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Settlement {
    /// Processing is over, the broker forgets the message.
    Ack,
    /// The broker puts the message back at the head of its queue.
    Requeue,
    /// The broker discards the message without redelivering it.
    Reject,
}

/// Broker hook receiving settlements.
pub trait Acknowledger: Send + Sync {
    fn settle(&self, queue: &str, tag: u64, settlement: Settlement) -> Result<(), Error>;
}

/// A message handed over by the broker.
#[derive(Clone)]
pub struct Delivery {
    queue: String,
    tag: u64,
    envelope: Arc<Envelope>,
    acknowledger: Arc<dyn Acknowledger>,
    settled: Arc<AtomicBool>,
}

impl Delivery {
    pub fn new(
        queue: &str,
        tag: u64,
        envelope: Envelope,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            queue: queue.to_owned(),
            tag,
            envelope: Arc::new(envelope),
            acknowledger,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Message identity. Falls back to the broker tag when the sender did not set one.
    pub fn id(&self) -> MessageId {
        match &self.envelope.message_id {
            Some(id) => id.clone(),
            None => MessageId::new(&format!("{}#{}", self.queue, self.tag)),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Acknowledges the delivery.
    pub fn ack(&self) -> Result<(), Error> {
        self.settle(Settlement::Ack)
    }

    /// Hands the delivery back to the broker.
    pub fn requeue(&self) -> Result<(), Error> {
        self.settle(Settlement::Requeue)
    }

    /// Refuses the delivery for good. The broker dead-letters it.
    pub fn reject(&self) -> Result<(), Error> {
        self.settle(Settlement::Reject)
    }

    /// Whether the delivery has been settled.
    pub fn is_acked(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    fn settle(&self, settlement: Settlement) -> Result<(), Error> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(Error::Transport(format!(
                "Delivery {} on {} is already settled",
                self.tag, self.queue
            )));
        }
        self.acknowledger.settle(&self.queue, self.tag, settlement)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("tag", &self.tag)
            .field("envelope", &self.envelope)
            .finish()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u64, Settlement)>>);

    impl Acknowledger for Recorder {
        fn settle(&self, _queue: &str, tag: u64, settlement: Settlement) -> Result<(), Error> {
            self.0.lock().unwrap().push((tag, settlement));
            Ok(())
        }
    }

    #[test]
    fn test_delivery_settles_once() {
        let recorder = Arc::new(Recorder::default());
        let delivery = Delivery::new("q", 7, Envelope::new("q"), recorder.clone());
        assert!(!delivery.is_acked());
        delivery.ack().unwrap();
        assert!(delivery.is_acked());
        assert!(delivery.clone().requeue().is_err());
        assert_eq!(*recorder.0.lock().unwrap(), vec![(7, Settlement::Ack)]);
    }

    #[test]
    fn test_delivery_identity() {
        let recorder = Arc::new(Recorder::default());
        let anonymous = Delivery::new("q", 3, Envelope::new("q"), recorder.clone());
        assert_eq!(anonymous.id(), MessageId::new("q#3"));
        let named = Delivery::new("q", 4, Envelope::new("q").with_id("m1"), recorder);
        assert_eq!(named.id(), MessageId::new("m1"));
    }

    #[test]
    fn test_rejected_delivery_is_settled() {
        let recorder = Arc::new(Recorder::default());
        let delivery = Delivery::new("q", 9, Envelope::new("q"), recorder.clone());
        delivery.reject().unwrap();
        assert!(delivery.is_acked());
        assert!(delivery.ack().is_err());
        assert_eq!(*recorder.0.lock().unwrap(), vec![(9, Settlement::Reject)]);
    }
}
