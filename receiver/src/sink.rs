// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Event sink and subscriber pattern implementation.
//!
//! Faults raised while processing messages are broadcast by the owning process. A `Sink` drains
//! such a broadcast channel in its own task and hands every event to a `Subscriber`, which is
//! where faults get forwarded to a supervisor, an alerting system or a test assertion.

use async_trait::async_trait;
use tokio::sync::broadcast::{Receiver as EventReceiver, error::RecvError};

use tracing::{debug, warn};

use std::fmt::Debug;

/// Marker for values carried on a broadcast channel drained by a `Sink`.
pub trait Event: Clone + Debug + Send + Sync + 'static {}

/// A sink that receives events and notifies a subscriber.
///
/// # Type Parameters
///
/// * `E` - The event type that this sink will process.
///
pub struct Sink<E: Event> {
    /// The subscriber that will be notified of events.
    subscriber: Box<dyn Subscriber<E>>,
    /// The broadcast receiver for events.
    event_receiver: EventReceiver<E>,
}

impl<E: Event> Sink<E> {
    /// Creates a new Sink with the given event receiver and subscriber.
    pub fn new(event_receiver: EventReceiver<E>, subscriber: impl Subscriber<E>) -> Self {
        Sink {
            subscriber: Box::new(subscriber),
            event_receiver,
        }
    }

    /// Runs the sink's event processing loop until the channel is closed. Events missed because
    /// the sink lagged behind are skipped.
    pub async fn run(&mut self) {
        loop {
            match self.event_receiver.recv().await {
                Ok(event) => {
                    debug!("Received event: {:?}. Notify to the subscriber.", event);
                    self.subscriber.notify(event).await;
                }
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Sink lagged behind, {} event(s) skipped.", skipped);
                    continue;
                }
            }
        }
    }

    /// Spawns the processing loop on the current runtime.
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }
}

/// Trait for types that process events received by a sink.
#[async_trait]
pub trait Subscriber<E: Event>: Send + Sync + 'static {
    /// Called for every event received by the sink.
    async fn notify(&self, event: E);
}
