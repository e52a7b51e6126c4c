// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Receiver
//!
//! A `Receiver` owns one mailbox: its broker consumer, its handlers and the bookkeeping of every
//! message it admitted. It moves through the following states:
//!
//! | From | Operation | To |
//! |---|---|---|
//! | `New` | `initialize` | `Ready` (through `Initializing`) |
//! | `Ready`, `Inactive` | `activate` | `Active` (through `Activating`) |
//! | `Active` | `deactivate` | `Inactive` (through `Deactivating`) |
//! | `Ready`, `Active`, `Inactive`, `Error` | `terminate` | `Terminated` (through `Terminating`) |
//! | any but `Terminating`, `Terminated` | broker fault | `Error` |
//!
//! A fault raised while another operation is under way wins: that operation leaves the receiver
//! in `Error` instead of its usual target state. The consumer only exists while the receiver is
//! `Active`.
//!
//! ## Message pipeline
//!
//! Deliveries are read by a dispatch task started on activation. For each delivery the dispatch
//! task admits the message (duplicate check, in-flight registration), drops it if the process is
//! shut off, and runs the inbound interceptor chain. Handlers then run in a task of their own so
//! that several messages of one receiver can be in flight at the same time. When the handlers are
//! done the message is released: it leaves the in-flight set, its conversation scope is closed
//! and the delivery is acknowledged. Admission and release of one receiver are serialized by its
//! ledger lock.
//!
//! `deactivate()` stops the consumer and then waits for the in-flight set to empty. The wait is
//! bounded by `ReceiverConfig::drain_timeout`; past it the remaining handler tasks are aborted and
//! their deliveries handed back to the broker.
//!

use crate::{
    Error,
    admission::AdmissionLog,
    config::ReceiverConfig,
    envelope::{Envelope, MessageId, ScopeRule},
    handler::{ErrorHandler, MessageHandler, Outbox, Rejection, RequestContext},
    interceptor::{Direction, InterceptorChain, Invocation, InvocationStatus},
    mailbox::MailboxHandle,
    process::{Process, ProcessFault},
    retry::{ExponentialBackoffStrategy, RetryStrategy, with_retries},
    topology::MailboxTopology,
    transport::{Consumer, Delivery, DeliveryReceiver, MailboxConfig, Transport},
};

use futures::FutureExt;
use tokio::{
    select,
    sync::{Mutex as AsyncMutex, mpsc, oneshot},
    task::{AbortHandle, JoinHandle},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use tracing::{debug, error, warn};

use std::{
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, RwLock, Weak},
};

/// Lifecycle state of a receiver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReceiverState {
    New,
    Initializing,
    Ready,
    Activating,
    Active,
    Deactivating,
    Inactive,
    Terminating,
    Terminated,
    Error,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReceiverState::New => "NEW",
            ReceiverState::Initializing => "INITIALIZING",
            ReceiverState::Ready => "READY",
            ReceiverState::Activating => "ACTIVATING",
            ReceiverState::Active => "ACTIVE",
            ReceiverState::Deactivating => "DEACTIVATING",
            ReceiverState::Inactive => "INACTIVE",
            ReceiverState::Terminating => "TERMINATING",
            ReceiverState::Terminated => "TERMINATED",
            ReceiverState::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}

/// A message admitted and not yet released.
struct InFlight {
    delivery: Delivery,
    /// Conversation pushed on the context stack for this message.
    opened: Option<String>,
    task: Option<AbortHandle>,
}

/// Per-message bookkeeping. Only admission and release mutate it.
struct Ledger {
    state: ReceiverState,
    admitted: AdmissionLog,
    in_flight: HashMap<MessageId, InFlight>,
    /// Present while a deactivation waits for the in-flight set to empty.
    drain: Option<oneshot::Sender<()>>,
}

/// Broker-side resources, owned by whichever lifecycle operation holds the lock.
struct Lifecycle {
    config: Option<MailboxConfig>,
    consumer: Option<Box<dyn Consumer>>,
    dispatcher: Option<(JoinHandle<()>, CancellationToken)>,
    retry: Box<dyn RetryStrategy>,
}

enum Admission {
    Admitted,
    /// The receiver no longer accepts messages.
    Refused,
    Duplicate,
}

struct Inner {
    label: String,
    mailbox: MailboxHandle,
    topology: Box<dyn MailboxTopology>,
    instance: String,
    /// Name senders use to reach this receiver's queue.
    address: String,
    process: Weak<Process>,
    transport: Arc<dyn Transport>,
    chain: InterceptorChain,
    config: ReceiverConfig,
    outbox: Outbox,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    error_handlers: RwLock<Vec<Arc<dyn ErrorHandler>>>,
    ledger: Mutex<Ledger>,
    lifecycle: AsyncMutex<Lifecycle>,
}

/// Builder for a `Receiver`.
pub struct ReceiverBuilder {
    label: String,
    mailbox: MailboxHandle,
    topology: Box<dyn MailboxTopology>,
    chain: InterceptorChain,
    config: ReceiverConfig,
    retry: Option<Box<dyn RetryStrategy>>,
}

impl ReceiverBuilder {
    /// Starts a receiver labelled `label` on `mailbox` with the given topology.
    pub fn new(label: &str, mailbox: MailboxHandle, topology: impl MailboxTopology) -> Self {
        Self {
            label: label.to_owned(),
            mailbox,
            topology: Box::new(topology),
            chain: InterceptorChain::new(),
            config: ReceiverConfig::default(),
            retry: None,
        }
    }

    pub fn interceptors(mut self, chain: InterceptorChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn config(mut self, config: ReceiverConfig) -> Self {
        self.config = config;
        self
    }

    /// Strategy pacing the retries of consumer opening. Defaults to exponential backoff with
    /// `ReceiverConfig::open_retries` retries.
    pub fn retry_strategy(mut self, strategy: impl RetryStrategy + 'static) -> Self {
        self.retry = Some(Box::new(strategy));
        self
    }

    /// Binds the receiver to `process` and `transport`.
    pub fn build(self, process: &Arc<Process>, transport: Arc<dyn Transport>) -> Receiver {
        let instance = format!("{}.{}", process.id(), self.label);
        let address = self
            .topology
            .declare(&self.mailbox, &instance)
            .address()
            .to_owned();
        let outbox = Outbox::new(
            &address,
            &instance,
            transport.clone(),
            self.chain.clone(),
            Arc::downgrade(process),
        );
        let retry = self.retry.unwrap_or_else(|| {
            Box::new(ExponentialBackoffStrategy::new(self.config.open_retries))
        });
        let admitted = AdmissionLog::new(
            self.config.admission_capacity,
            self.config.admission_ttl,
        );
        Receiver {
            inner: Arc::new(Inner {
                label: self.label,
                mailbox: self.mailbox,
                topology: self.topology,
                instance,
                address,
                process: Arc::downgrade(process),
                transport,
                chain: self.chain,
                config: self.config,
                outbox,
                handlers: RwLock::new(Vec::new()),
                error_handlers: RwLock::new(Vec::new()),
                ledger: Mutex::new(Ledger {
                    state: ReceiverState::New,
                    admitted,
                    in_flight: HashMap::new(),
                    drain: None,
                }),
                lifecycle: AsyncMutex::new(Lifecycle {
                    config: None,
                    consumer: None,
                    dispatcher: None,
                    retry,
                }),
            }),
        }
    }
}

/// Message receiver bound to one broker mailbox.
#[derive(Clone)]
pub struct Receiver {
    inner: Arc<Inner>,
}

impl Receiver {
    /// Shorthand for `ReceiverBuilder::new`.
    pub fn builder(
        label: &str,
        mailbox: MailboxHandle,
        topology: impl MailboxTopology,
    ) -> ReceiverBuilder {
        ReceiverBuilder::new(label, mailbox, topology)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn mailbox(&self) -> &MailboxHandle {
        &self.inner.mailbox
    }

    /// The broker-visible mailbox name.
    pub fn scoped_name(&self) -> &str {
        self.inner.mailbox.scoped_name()
    }

    /// Where messages for this receiver are sent. Equal to the scoped name except for exclusive
    /// inboxes, whose address is private to the process instance.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn state(&self) -> ReceiverState {
        self.inner.ledger().state
    }

    /// Number of messages admitted and not yet released.
    pub fn in_flight(&self) -> usize {
        self.inner.ledger().in_flight.len()
    }

    /// Number of identities remembered for duplicate detection.
    pub fn admitted(&self) -> usize {
        self.inner.ledger().admitted.len()
    }

    /// Appends a message handler. Handlers run in registration order.
    pub fn add_handler(&self, handler: impl MessageHandler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(handler));
    }

    /// Appends an error handler, invoked for rejected messages in registration order.
    pub fn add_error_handler(&self, handler: impl ErrorHandler) {
        self.inner
            .error_handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(handler));
    }

    /// Declares and resolves the mailbox.
    ///
    /// # Errors
    ///
    /// Returns `Error::MailboxNotFound` if the broker can not resolve the mailbox; the receiver
    /// is then in `Error` state.
    ///
    pub async fn initialize(&self) -> Result<(), Error> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.begin(
            &[ReceiverState::New],
            ReceiverState::Initializing,
            "initialize",
        )?;
        debug!(
            "Receiver {} is initializing {} mailbox {}.",
            self.inner.label,
            self.inner.topology.kind(),
            self.inner.mailbox
        );

        let declaration = self
            .inner
            .topology
            .declare(&self.inner.mailbox, &self.inner.instance);
        let resolved = async {
            self.inner.transport.declare(&declaration).await?;
            self.inner
                .transport
                .resolve(self.inner.mailbox.scoped_name(), &declaration.queue)
                .await
        }
        .await;

        match resolved {
            Ok(config) => {
                if !self.inner.advance(ReceiverState::Initializing, ReceiverState::Ready) {
                    return Err(Error::Transport(format!(
                        "Receiver {} faulted while initializing",
                        self.inner.label
                    )));
                }
                lifecycle.config = Some(config);
                debug!("Receiver {} is ready.", self.inner.label);
                Ok(())
            }
            Err(e) => {
                error!(
                    "Receiver {} can not resolve mailbox {}: {}",
                    self.inner.label, self.inner.mailbox, e
                );
                self.inner.set_state(ReceiverState::Error);
                Err(e)
            }
        }
    }

    /// Opens the broker consumer and starts delivery.
    pub async fn activate(&self) -> Result<(), Error> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.begin(
            &[ReceiverState::Ready, ReceiverState::Inactive],
            ReceiverState::Activating,
            "activate",
        )?;

        match self.open(&mut lifecycle).await {
            Ok(()) => {
                debug!(
                    "Receiver {} is active on {}.",
                    self.inner.label, self.inner.mailbox
                );
                Ok(())
            }
            Err(e) => {
                error!("Receiver {} can not activate: {}", self.inner.label, e);
                self.inner.set_state(ReceiverState::Error);
                Err(e)
            }
        }
    }

    /// Stops delivery and waits until every in-flight message is released.
    ///
    /// # Errors
    ///
    /// Returns `Error::DrainTimeout` if the in-flight messages did not finish within the drain
    /// timeout. They have been cancelled and requeued, and the receiver is `Inactive`.
    ///
    pub async fn deactivate(&self) -> Result<(), Error> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.begin(
            &[ReceiverState::Active],
            ReceiverState::Deactivating,
            "deactivate",
        )?;
        debug!("Receiver {} is deactivating.", self.inner.label);

        let drained = self.close(&mut lifecycle).await;
        if self.inner.advance(ReceiverState::Deactivating, ReceiverState::Inactive) {
            debug!("Receiver {} is inactive.", self.inner.label);
        } else {
            warn!(
                "Receiver {} faulted while draining, it stays in error.",
                self.inner.label
            );
        }
        drained
    }

    /// Releases the consumer permanently. An active receiver is drained first.
    pub async fn terminate(&self) -> Result<(), Error> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let previous = self.inner.begin(
            &[
                ReceiverState::Ready,
                ReceiverState::Active,
                ReceiverState::Inactive,
                ReceiverState::Error,
            ],
            ReceiverState::Terminating,
            "terminate",
        )?;
        debug!("Receiver {} is terminating.", self.inner.label);

        let drained = if previous == ReceiverState::Active {
            self.close(&mut lifecycle).await
        } else {
            self.stop_consumer(&mut lifecycle).await;
            Ok(())
        };
        lifecycle.config = None;
        self.inner.set_state(ReceiverState::Terminated);
        debug!("Receiver {} is terminated.", self.inner.label);
        drained
    }

    /// Initializes and activates the receiver. Returns the address senders reach it at.
    pub async fn attach(&self) -> Result<String, Error> {
        self.initialize().await?;
        self.activate().await?;
        Ok(self.address().to_owned())
    }

    /// Signals a broker-level fault: the receiver goes to `Error` and its consumer is released.
    /// Messages already in flight still finish. A terminating or terminated receiver ignores it.
    pub async fn fault(&self, error: Error) {
        if !self.inner.mark_fault(error) {
            return;
        }
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.stop_consumer(&mut lifecycle).await;
    }

    /// Sends a message through the outbound interceptor chain. The sender defaults to this
    /// receiver's scoped name. Returns `None` if the chain dropped the message.
    pub async fn send(&self, envelope: Envelope) -> Result<Option<Envelope>, Error> {
        self.inner.outbox.send(envelope).await
    }

    async fn open(&self, lifecycle: &mut Lifecycle) -> Result<(), Error> {
        if self.inner.process.upgrade().is_none() {
            return Err(Error::ProcessGone);
        }
        let config = lifecycle
            .config
            .clone()
            .ok_or_else(|| Error::MailboxNotFound(self.inner.mailbox.scoped_name().to_owned()))?;
        let transport = self.inner.transport.clone();
        lifecycle.retry.reset();
        let mut consumer = with_retries(
            "Opening consumer",
            lifecycle.retry.as_mut(),
            || transport.open_consumer(&config),
        )
        .await?;

        let (sender, deliveries) = mpsc::unbounded_channel();
        if let Err(e) = consumer.consume(sender).await {
            let _ = consumer.close().await;
            return Err(e);
        }
        if !self.inner.advance(ReceiverState::Activating, ReceiverState::Active) {
            let _ = consumer.close().await;
            return Err(Error::Transport(format!(
                "Receiver {} faulted while activating",
                self.inner.label
            )));
        }

        let stop = CancellationToken::new();
        let handle = tokio::spawn(dispatch(
            Arc::downgrade(&self.inner),
            deliveries,
            stop.clone(),
        ));
        lifecycle.consumer = Some(consumer);
        lifecycle.dispatcher = Some((handle, stop));
        Ok(())
    }

    /// Stops the consumer and the dispatch task, then waits for the drain.
    async fn close(&self, lifecycle: &mut Lifecycle) -> Result<(), Error> {
        let drain = {
            let mut ledger = self.inner.ledger();
            if ledger.in_flight.is_empty() {
                None
            } else {
                let (sender, receiver) = oneshot::channel();
                ledger.drain = Some(sender);
                debug!(
                    "Receiver {} waits for {} in-flight message(s).",
                    self.inner.label,
                    ledger.in_flight.len()
                );
                Some(receiver)
            }
        };

        if let Some(mut consumer) = lifecycle.consumer.take() {
            if let Err(e) = consumer.cancel().await {
                warn!("Receiver {} can not cancel consumer: {}", self.inner.label, e);
            }
            if let Err(e) = consumer.close().await {
                warn!("Receiver {} can not close consumer: {}", self.inner.label, e);
            }
        }

        let dispatcher = lifecycle.dispatcher.take();
        let abort = dispatcher.as_ref().map(|(handle, _)| handle.abort_handle());
        let wait = async {
            if let Some((handle, stop)) = dispatcher {
                stop.cancel();
                let _ = handle.await;
            }
            if let Some(drain) = drain {
                let _ = drain.await;
            }
        };

        match timeout(self.inner.config.drain_timeout, wait).await {
            Ok(()) => Ok(()),
            Err(_) => {
                if let Some(abort) = abort {
                    abort.abort();
                }
                let abandoned = self.inner.force_release();
                warn!(
                    "Receiver {} drain timed out, {} message(s) cancelled and requeued.",
                    self.inner.label, abandoned
                );
                Err(Error::DrainTimeout { abandoned })
            }
        }
    }

    /// Releases the consumer and stops the dispatch task without waiting for the drain.
    async fn stop_consumer(&self, lifecycle: &mut Lifecycle) {
        if let Some(mut consumer) = lifecycle.consumer.take() {
            let _ = consumer.cancel().await;
            if let Err(e) = consumer.close().await {
                warn!("Receiver {} can not close consumer: {}", self.inner.label, e);
            }
        }
        if let Some((_, stop)) = lifecycle.dispatcher.take() {
            stop.cancel();
        }
    }
}

/// Reads deliveries until the channel closes, `stop` is cancelled or the receiver stops
/// admitting. Deliveries left in the channel are handed back to the broker.
async fn dispatch(
    inner: Weak<Inner>,
    mut deliveries: DeliveryReceiver,
    stop: CancellationToken,
) {
    loop {
        let delivery = select! {
            biased;
            _ = stop.cancelled() => break,
            delivery = deliveries.recv() => delivery,
        };
        let Some(delivery) = delivery else {
            if let Some(inner) = inner.upgrade() {
                Inner::lost_consumer(&inner);
            }
            return;
        };
        let Some(receiver) = inner.upgrade() else {
            let _ = delivery.requeue();
            break;
        };
        if !Inner::receive(&receiver, delivery).await {
            break;
        }
    }

    deliveries.close();
    while let Ok(delivery) = deliveries.try_recv() {
        if let Err(e) = delivery.requeue() {
            warn!("Can not requeue delivery {}: {}", delivery.id(), e);
        }
    }
}

impl Inner {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves to `next` if the current state is one of `allowed`. Returns the previous state.
    fn begin(
        &self,
        allowed: &[ReceiverState],
        next: ReceiverState,
        operation: &str,
    ) -> Result<ReceiverState, Error> {
        let mut ledger = self.ledger();
        let current = ledger.state;
        if !allowed.contains(&current) {
            error!(
                "Receiver {} can not {} from state {}.",
                self.label, operation, current
            );
            return Err(Error::InvalidTransition {
                from: current.to_string(),
                operation: operation.to_owned(),
            });
        }
        ledger.state = next;
        Ok(current)
    }

    fn set_state(&self, state: ReceiverState) {
        self.ledger().state = state;
    }

    /// Moves from `from` to `to`. Returns false if the state changed under us.
    fn advance(&self, from: ReceiverState, to: ReceiverState) -> bool {
        let mut ledger = self.ledger();
        if ledger.state != from {
            return false;
        }
        ledger.state = to;
        true
    }

    /// Moves to `Error` and publishes the fault. Returns false once termination began.
    fn mark_fault(&self, error: Error) -> bool {
        {
            let mut ledger = self.ledger();
            if matches!(ledger.state, ReceiverState::Terminating | ReceiverState::Terminated) {
                debug!("Receiver {} is {}, fault ignored: {}", self.label, ledger.state, error);
                return false;
            }
            ledger.state = ReceiverState::Error;
        }
        self.report(None, error);
        true
    }

    fn report(&self, message: Option<MessageId>, error: Error) {
        let fault = ProcessFault {
            receiver: self.label.clone(),
            message,
            error,
        };
        match self.process.upgrade() {
            Some(process) => process.report(fault),
            None => error!(
                "Receiver {} fault with no process to report to: {}",
                self.label, fault.error
            ),
        }
    }

    /// The delivery stream ended on its own.
    fn lost_consumer(inner: &Arc<Inner>) {
        if inner.ledger().state != ReceiverState::Active {
            return;
        }
        if !inner.mark_fault(Error::Transport(format!(
            "Consumer of {} stopped delivering",
            inner.mailbox
        ))) {
            return;
        }
        let receiver = Receiver {
            inner: inner.clone(),
        };
        tokio::spawn(async move {
            let mut lifecycle = receiver.inner.lifecycle.lock().await;
            receiver.stop_consumer(&mut lifecycle).await;
        });
    }

    fn admit(&self, id: &MessageId, delivery: &Delivery) -> Admission {
        let mut ledger = self.ledger();
        if ledger.state != ReceiverState::Active {
            return Admission::Refused;
        }
        if ledger.in_flight.contains_key(id) || ledger.admitted.contains(id) {
            return Admission::Duplicate;
        }
        let Ledger {
            admitted,
            in_flight,
            ..
        } = &mut *ledger;
        in_flight.insert(
            id.clone(),
            InFlight {
                delivery: delivery.clone(),
                opened: None,
                task: None,
            },
        );
        admitted.insert(id.clone(), |other| in_flight.contains_key(other));
        Admission::Admitted
    }

    fn attach_task(&self, id: &MessageId, task: AbortHandle) {
        if let Some(entry) = self.ledger().in_flight.get_mut(id) {
            entry.task = Some(task);
        }
    }

    /// Pushes `conversation` for an in-flight message. Returns false if the message was
    /// released in the meantime.
    fn open_scope(&self, id: &MessageId, conversation: &str, process: &Process) -> bool {
        let mut ledger = self.ledger();
        let Some(entry) = ledger.in_flight.get_mut(id) else {
            return false;
        };
        process.contexts().push(conversation);
        entry.opened = Some(conversation.to_owned());
        true
    }

    /// Removes a message from the in-flight set, closes its conversation scope, acknowledges its
    /// delivery and resolves a pending drain.
    fn release(&self, id: &MessageId, process: Option<&Process>) {
        let mut ledger = self.ledger();
        let Some(entry) = ledger.in_flight.remove(id) else {
            debug!("Message {} was already released.", id);
            return;
        };
        if let (Some(conversation), Some(process)) = (&entry.opened, process) {
            close_scope(process, conversation);
        }
        if entry.delivery.is_acked() {
            warn!("Delivery of message {} was settled by a handler.", id);
        } else if let Err(e) = entry.delivery.ack() {
            error!("Can not acknowledge message {}: {}", id, e);
        }
        if ledger.in_flight.is_empty() {
            if let Some(drain) = ledger.drain.take() {
                debug!("Receiver {} is drained.", self.label);
                let _ = drain.send(());
            }
        }
    }

    /// Cancels every in-flight message. Returns how many there were.
    fn force_release(&self) -> usize {
        let process = self.process.upgrade();
        let mut ledger = self.ledger();
        let abandoned: Vec<(MessageId, InFlight)> = ledger.in_flight.drain().collect();
        ledger.drain = None;
        for (id, entry) in &abandoned {
            if let Some(task) = &entry.task {
                task.abort();
            }
            if let (Some(conversation), Some(process)) = (&entry.opened, &process) {
                close_scope(process, conversation);
            }
            ledger.admitted.remove(id);
            if let Err(e) = entry.delivery.requeue() {
                warn!("Can not requeue message {}: {}", id, e);
            }
        }
        abandoned.len()
    }

    /// Admits and dispatches one delivery. Returns false once the receiver stopped admitting.
    async fn receive(inner: &Arc<Inner>, delivery: Delivery) -> bool {
        let id = delivery.id();
        match inner.admit(&id, &delivery) {
            Admission::Admitted => {}
            Admission::Refused => {
                debug!(
                    "Receiver {} is not active, requeueing message {}.",
                    inner.label, id
                );
                if let Err(e) = delivery.requeue() {
                    warn!("Can not requeue message {}: {}", id, e);
                }
                return false;
            }
            Admission::Duplicate => {
                inner.report(Some(id.clone()), Error::DuplicateMessage(id.to_string()));
                if let Err(e) = delivery.reject() {
                    warn!("Can not reject duplicate message {}: {}", id, e);
                }
                return true;
            }
        }

        let Some(process) = inner.process.upgrade() else {
            warn!(
                "Receiver {} has no process, message {} dropped.",
                inner.label, id
            );
            inner.release(&id, None);
            return true;
        };

        if process.is_shut_off() {
            warn!(
                "Process {} is shut off, message {} acknowledged and dropped.",
                process.id(),
                id
            );
            inner.release(&id, Some(&process));
            return true;
        }

        let invocation = inner
            .chain
            .run(Invocation::new(
                Direction::Inbound,
                delivery.envelope().clone(),
                Arc::downgrade(&process),
            ))
            .await;

        let task_inner = inner.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            task_inner.run_handlers(task_id, invocation, process).await;
        });
        inner.attach_task(&id, handle.abort_handle());
        true
    }

    async fn run_handlers(&self, id: MessageId, invocation: Invocation, process: Arc<Process>) {
        let Invocation {
            message,
            content,
            status,
            ..
        } = invocation;

        match status {
            InvocationStatus::Drop => {
                warn!(
                    "Message {} dropped by the interceptor chain of {}.",
                    id, self.label
                );
            }
            InvocationStatus::Reject { code, reason } => {
                debug!("Message {} rejected with {}: {}", id, code, reason);
                let rejection = Rejection { code, reason };
                let ctx = RequestContext::new(
                    &self.label,
                    id.clone(),
                    message.conv_id.clone(),
                    message.clone(),
                    process.clone(),
                    self.outbox.clone(),
                );
                let handlers = self
                    .error_handlers
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                for handler in handlers {
                    let outcome =
                        AssertUnwindSafe(handler.handle(&content, &message, &rejection, &ctx))
                            .catch_unwind()
                            .await;
                    self.check(&id, outcome);
                }
            }
            InvocationStatus::Process => {
                let conversation = match message.scope_rule() {
                    ScopeRule::Open => {
                        if let Some(conversation) = &message.conv_id {
                            if !self.open_scope(&id, conversation, &process) {
                                return;
                            }
                        }
                        message.conv_id.clone()
                    }
                    ScopeRule::Inherit => message.conv_id.clone(),
                    ScopeRule::Fallback => {
                        let current = process.contexts().current_or_sentinel();
                        warn!(
                            "Message {} has unexpected rpc performative {}, using context {}.",
                            id,
                            message.performative.as_deref().unwrap_or("none"),
                            current
                        );
                        Some(current)
                    }
                };
                let ctx = RequestContext::new(
                    &self.label,
                    id.clone(),
                    conversation,
                    message.clone(),
                    process.clone(),
                    self.outbox.clone(),
                );
                let handlers = self
                    .handlers
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                for handler in handlers {
                    let outcome = AssertUnwindSafe(handler.handle(&content, &message, &ctx))
                        .catch_unwind()
                        .await;
                    self.check(&id, outcome);
                }
            }
        }

        self.release(&id, Some(&process));
    }

    /// Reports a failed or panicked handler.
    fn check(
        &self,
        id: &MessageId,
        outcome: Result<Result<(), Error>, Box<dyn std::any::Any + Send>>,
    ) {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.report(Some(id.clone()), e),
            Err(_) => self.report(Some(id.clone()), Error::HandlerPanic(id.to_string())),
        }
    }
}

/// Pops `conversation` and clears its caches once its outermost scope is closed.
fn close_scope(process: &Process, conversation: &str) {
    let popped = process.contexts().pop(conversation);
    if popped.closed {
        process.caches().clear(conversation);
    }
}
