// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! In-memory broker.
//!
//! Exchanges, queues and bindings live in one process. Envelopes are stored in their wire form
//! and decoded when handed to a consumer. Queues with several consumers dispatch round-robin.
//!

use crate::{
    Error,
    envelope::Envelope,
    topology::{Declaration, ExchangeKind},
    transport::{
        Acknowledger, Consumer, Delivery, DeliverySender, MailboxConfig, Settlement, Transport,
    },
};

use async_trait::async_trait;

use tracing::{debug, error};

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

struct Queue {
    declaration: Declaration,
    ready: VecDeque<Vec<u8>>,
    unacked: HashMap<u64, Vec<u8>>,
    dead_letters: Vec<Vec<u8>>,
    consumers: Vec<(u64, DeliverySender)>,
    cursor: usize,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    /// Exchange name to `(routing key, queue)` bindings.
    bindings: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, Queue>,
    next_tag: u64,
    next_consumer: u64,
}

/// Broker keeping every queue in memory.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, Error> {
        self.state
            .lock()
            .map_err(|e| Error::Transport(format!("Can not lock broker state: {}", e)))
    }

    /// Number of `(ready, unacked)` messages on a queue.
    pub fn queue_depth(&self, queue: &str) -> Option<(usize, usize)> {
        let state = self.lock().ok()?;
        state
            .queues
            .get(queue)
            .map(|q| (q.ready.len(), q.unacked.len()))
    }

    /// Number of rejected messages parked aside for a queue.
    pub fn dead_letters(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|state| state.queues.get(queue).map(|q| q.dead_letters.len()))
            .unwrap_or(0)
    }

    /// Number of consumers attached to a queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|state| state.queues.get(queue).map(|q| q.consumers.len()))
            .unwrap_or(0)
    }

    /// Hands ready messages of `queue` to its consumers.
    fn pump(&self, state: &mut BrokerState, queue: &str) {
        loop {
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            if q.consumers.is_empty() {
                return;
            }
            let Some(bytes) = q.ready.pop_front() else {
                return;
            };
            let envelope = match Envelope::decode(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!("Discarding undecodable message on {}: {}", queue, e);
                    continue;
                }
            };
            state.next_tag += 1;
            let tag = state.next_tag;
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            let index = q.cursor % q.consumers.len();
            let delivery = Delivery::new(queue, tag, envelope, Arc::new(self.clone()));
            if q.consumers[index].1.send(delivery).is_err() {
                debug!("Consumer of {} is gone, dropping it.", queue);
                q.consumers.remove(index);
                q.ready.push_front(bytes);
                continue;
            }
            q.cursor = index + 1;
            q.unacked.insert(tag, bytes);
        }
    }
}

impl Acknowledger for MemoryBroker {
    fn settle(&self, queue: &str, tag: u64, settlement: Settlement) -> Result<(), Error> {
        let mut state = self.lock()?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::MailboxNotFound(queue.to_owned()))?;
        let bytes = q.unacked.remove(&tag).ok_or_else(|| {
            Error::Transport(format!("Unknown delivery tag {} on {}", tag, queue))
        })?;
        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                debug!("Requeueing delivery {} on {}.", tag, queue);
                q.ready.push_front(bytes);
                self.pump(&mut state, queue);
            }
            Settlement::Reject => {
                debug!("Dead-lettering delivery {} on {}.", tag, queue);
                q.dead_letters.push(bytes);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn declare(&self, declaration: &Declaration) -> Result<(), Error> {
        let mut state = self.lock()?;
        match state.exchanges.get(&declaration.exchange) {
            Some(kind) if *kind != declaration.kind => {
                return Err(Error::Transport(format!(
                    "Exchange {} is already declared as {:?}",
                    declaration.exchange, kind
                )));
            }
            Some(_) => {}
            None => {
                state
                    .exchanges
                    .insert(declaration.exchange.clone(), declaration.kind);
            }
        }
        state
            .queues
            .entry(declaration.queue.clone())
            .or_insert_with(|| Queue {
                declaration: declaration.clone(),
                ready: VecDeque::new(),
                unacked: HashMap::new(),
                dead_letters: Vec::new(),
                consumers: Vec::new(),
                cursor: 0,
            });
        let binding = (declaration.routing_key.clone(), declaration.queue.clone());
        let bindings = state
            .bindings
            .entry(declaration.exchange.clone())
            .or_default();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        debug!(
            "Declared queue {} on exchange {}.",
            declaration.queue, declaration.exchange
        );
        Ok(())
    }

    async fn resolve(&self, scoped_name: &str, queue: &str) -> Result<MailboxConfig, Error> {
        let state = self.lock()?;
        state
            .queues
            .get(queue)
            .map(|q| MailboxConfig {
                scoped_name: scoped_name.to_owned(),
                declaration: q.declaration.clone(),
            })
            .ok_or_else(|| Error::MailboxNotFound(scoped_name.to_owned()))
    }

    async fn open_consumer(&self, config: &MailboxConfig) -> Result<Box<dyn Consumer>, Error> {
        let mut state = self.lock()?;
        if !state.queues.contains_key(&config.declaration.queue) {
            return Err(Error::MailboxNotFound(config.scoped_name.clone()));
        }
        state.next_consumer += 1;
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            queue: config.declaration.queue.clone(),
            id: state.next_consumer,
        }))
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), Error> {
        let bytes = envelope.encode()?;
        let mut state = self.lock()?;
        let targets: Vec<String> = match state.exchanges.get(&envelope.receiver) {
            Some(ExchangeKind::Fanout) => state
                .bindings
                .get(&envelope.receiver)
                .map(|b| b.iter().map(|(_, queue)| queue.clone()).collect())
                .unwrap_or_default(),
            _ => state
                .bindings
                .iter()
                .filter(|(exchange, _)| {
                    state.exchanges.get(*exchange) == Some(&ExchangeKind::Direct)
                })
                .flat_map(|(_, b)| b.iter())
                .filter(|(key, _)| *key == envelope.receiver)
                .map(|(_, queue)| queue.clone())
                .collect(),
        };
        if targets.is_empty() {
            debug!("No route for {}, message discarded.", envelope.receiver);
            return Ok(());
        }
        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(bytes.clone());
            }
            self.pump(&mut state, &queue);
        }
        Ok(())
    }
}

/// Consumer attached to one queue of a `MemoryBroker`.
pub struct MemoryConsumer {
    broker: MemoryBroker,
    queue: String,
    id: u64,
}

impl MemoryConsumer {
    fn detach(&self) -> Result<(), Error> {
        let mut state = self.broker.lock()?;
        if let Some(q) = state.queues.get_mut(&self.queue) {
            q.consumers.retain(|(id, _)| *id != self.id);
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn consume(&mut self, deliveries: DeliverySender) -> Result<(), Error> {
        let mut state = self.broker.lock()?;
        let q = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| Error::MailboxNotFound(self.queue.clone()))?;
        if q.declaration.exclusive && q.consumers.iter().any(|(id, _)| *id != self.id) {
            return Err(Error::Transport(format!(
                "Queue {} is exclusive and already consumed",
                self.queue
            )));
        }
        q.consumers.retain(|(id, _)| *id != self.id);
        q.consumers.push((self.id, deliveries));
        self.broker.pump(&mut state, &self.queue);
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), Error> {
        self.detach()
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.detach()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::{
        mailbox::{MailboxHandle, Scope, SystemId},
        topology::{Fanout, MailboxTopology, SharedWork},
    };

    use tokio::sync::mpsc;

    fn handle(name: &str) -> MailboxHandle {
        MailboxHandle::new(name, Scope::System, &SystemId::new("test", "c1")).unwrap()
    }

    async fn consumer_on(
        broker: &MemoryBroker,
        declaration: &Declaration,
    ) -> (Box<dyn Consumer>, mpsc::UnboundedReceiver<Delivery>) {
        broker.declare(declaration).await.unwrap();
        let config = broker.resolve("x", &declaration.queue).await.unwrap();
        let mut consumer = broker.open_consumer(&config).await.unwrap();
        let (sender, receiver) = mpsc::unbounded_channel();
        consumer.consume(sender).await.unwrap();
        (consumer, receiver)
    }

    #[tokio::test]
    async fn test_resolve_unknown_queue() {
        let broker = MemoryBroker::new();
        assert_eq!(
            broker.resolve("test.nothing", "test.nothing").await,
            Err(Error::MailboxNotFound("test.nothing".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_shared_queue_round_robin() {
        let broker = MemoryBroker::new();
        let decl = SharedWork.declare(&handle("jobs"), "a");
        let (_c1, mut r1) = consumer_on(&broker, &decl).await;
        let (_c2, mut r2) = consumer_on(&broker, &decl).await;

        for i in 0..4 {
            broker
                .publish(&Envelope::new("test.jobs").with_id(&format!("m{}", i)))
                .await
                .unwrap();
        }
        let mut first = vec![];
        while let Ok(d) = r1.try_recv() {
            first.push(d.id().to_string());
        }
        let mut second = vec![];
        while let Ok(d) = r2.try_recv() {
            second.push(d.id().to_string());
        }
        assert_eq!(first, vec!["m0", "m2"]);
        assert_eq!(second, vec!["m1", "m3"]);
        assert_eq!(broker.queue_depth("test.jobs"), Some((0, 4)));
    }

    #[tokio::test]
    async fn test_fanout_copies() {
        let broker = MemoryBroker::new();
        let mailbox = handle("announce");
        let (_c1, mut r1) = consumer_on(&broker, &Fanout.declare(&mailbox, "a")).await;
        let (_c2, mut r2) = consumer_on(&broker, &Fanout.declare(&mailbox, "b")).await;

        broker
            .publish(&Envelope::new("test.announce").with_id("m1"))
            .await
            .unwrap();
        assert_eq!(r1.try_recv().unwrap().id().as_str(), "m1");
        assert_eq!(r2.try_recv().unwrap().id().as_str(), "m1");
    }

    #[tokio::test]
    async fn test_requeue_redelivers() {
        let broker = MemoryBroker::new();
        let decl = SharedWork.declare(&handle("jobs"), "a");
        let (mut consumer, mut receiver) = consumer_on(&broker, &decl).await;
        broker
            .publish(&Envelope::new("test.jobs").with_id("m1"))
            .await
            .unwrap();
        let delivery = receiver.try_recv().unwrap();
        consumer.cancel().await.unwrap();
        delivery.requeue().unwrap();
        assert_eq!(broker.queue_depth("test.jobs"), Some((1, 0)));

        let (sender, mut receiver) = mpsc::unbounded_channel();
        consumer.consume(sender).await.unwrap();
        let again = receiver.try_recv().unwrap();
        assert_eq!(again.id().as_str(), "m1");
        again.ack().unwrap();
        assert_eq!(broker.queue_depth("test.jobs"), Some((0, 0)));
    }

    #[tokio::test]
    async fn test_reject_dead_letters() {
        let broker = MemoryBroker::new();
        let decl = SharedWork.declare(&handle("jobs"), "a");
        let (_consumer, mut receiver) = consumer_on(&broker, &decl).await;
        broker
            .publish(&Envelope::new("test.jobs").with_id("m1"))
            .await
            .unwrap();
        receiver.try_recv().unwrap().reject().unwrap();

        assert_eq!(broker.queue_depth("test.jobs"), Some((0, 0)));
        assert_eq!(broker.dead_letters("test.jobs"), 1);
        assert!(receiver.try_recv().is_err());
    }
}
