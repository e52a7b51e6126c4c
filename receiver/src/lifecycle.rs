// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Service lifecycle
//!
//! A long-running service owns one inbound `Receiver` and four business hooks. `ServiceProcess`
//! sequences them so that the receiver is drained before the service tears anything down: a
//! `on_deactivate` hook never runs while a request handler of the service is still in flight.
//!
//! | Phase | Order |
//! |---|---|
//! | `init` | `on_init`, then `Receiver::initialize` |
//! | `activate` | `on_activate`, then `Receiver::activate` |
//! | `deactivate` | `Receiver::deactivate`, then `on_deactivate` |
//! | `terminate` | `on_deactivate`, then `on_terminate` |
//!

use crate::{Error, receiver::Receiver};

use async_trait::async_trait;

use tracing::{debug, error};

/// Business side of a long-running service.
///
/// Every hook defaults to doing nothing. Hooks get the service's receiver so that `on_init` can
/// register handlers before the mailbox is declared.
///
/// # Examples
///
/// ```ignore
/// struct Echo;
///
/// #[async_trait]
/// impl Service for Echo {
///     async fn on_init(&mut self, receiver: &Receiver) -> Result<(), Error> {
///         receiver.add_handler(EchoHandler);
///         Ok(())
///     }
/// }
///
/// let mut service = ServiceProcess::new(Echo, receiver);
/// service.init().await?;
/// service.activate().await?;
/// ```
///
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Runs before the receiver is initialized. An error aborts `init` and the receiver is
    /// left untouched.
    async fn on_init(&mut self, _receiver: &Receiver) -> Result<(), Error> {
        Ok(())
    }

    /// Runs before the receiver starts consuming.
    async fn on_activate(&mut self, _receiver: &Receiver) -> Result<(), Error> {
        Ok(())
    }

    /// Runs once the receiver stopped consuming and has no message in flight.
    async fn on_deactivate(&mut self, _receiver: &Receiver) -> Result<(), Error> {
        Ok(())
    }

    async fn on_terminate(&mut self, _receiver: &Receiver) -> Result<(), Error> {
        Ok(())
    }
}

/// A service bound to its inbound receiver.
pub struct ServiceProcess<S: Service> {
    service: S,
    receiver: Receiver,
}

impl<S: Service> ServiceProcess<S> {
    pub fn new(service: S, receiver: Receiver) -> Self {
        Self { service, receiver }
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }

    /// Runs `on_init`, then initializes the receiver.
    pub async fn init(&mut self) -> Result<(), Error> {
        debug!("Service {} is initializing.", self.receiver.label());
        if let Err(e) = self.service.on_init(&self.receiver).await {
            error!("Service {} failed to initialize: {}", self.receiver.label(), e);
            return Err(e);
        }
        self.receiver.initialize().await
    }

    /// Runs `on_activate`, then activates the receiver.
    pub async fn activate(&mut self) -> Result<(), Error> {
        debug!("Service {} is activating.", self.receiver.label());
        if let Err(e) = self.service.on_activate(&self.receiver).await {
            error!("Service {} failed to activate: {}", self.receiver.label(), e);
            return Err(e);
        }
        self.receiver.activate().await
    }

    /// Drains the receiver, then runs `on_deactivate`.
    ///
    /// # Errors
    ///
    /// Returns `Error::DrainTimeout` if the drain had to cancel in-flight messages. `on_deactivate`
    /// has still run in that case, since nothing is in flight anymore.
    ///
    pub async fn deactivate(&mut self) -> Result<(), Error> {
        debug!("Service {} is deactivating.", self.receiver.label());
        let drained = match self.receiver.deactivate().await {
            Ok(()) => Ok(()),
            Err(e @ Error::DrainTimeout { .. }) => Err(e),
            Err(e) => return Err(e),
        };
        self.service.on_deactivate(&self.receiver).await?;
        drained
    }

    /// Runs `on_deactivate`, then `on_terminate`. The receiver is expected to be inactive
    /// already and is left as is.
    pub async fn terminate(&mut self) -> Result<(), Error> {
        debug!("Service {} is terminating.", self.receiver.label());
        self.service.on_deactivate(&self.receiver).await?;
        self.service.on_terminate(&self.receiver).await
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::{
        envelope::Envelope,
        handler::{MessageHandler, RequestContext},
        mailbox::{MailboxHandle, Scope, SystemId},
        memory::MemoryBroker,
        process::Process,
        receiver::ReceiverState,
        topology::SharedWork,
        transport::Transport,
    };

    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };
    use tokio::sync::Notify;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Recording {
        trace: Trace,
        fail_init: bool,
    }

    impl Recording {
        fn record(&self, hook: &str, receiver: &Receiver) {
            self.trace.lock().unwrap().push(format!(
                "{} {} {}",
                hook,
                receiver.state(),
                receiver.in_flight()
            ));
        }
    }

    #[async_trait]
    impl Service for Recording {
        async fn on_init(&mut self, receiver: &Receiver) -> Result<(), Error> {
            self.record("init", receiver);
            if self.fail_init {
                return Err(Error::Service("no database".to_owned()));
            }
            Ok(())
        }

        async fn on_activate(&mut self, receiver: &Receiver) -> Result<(), Error> {
            self.record("activate", receiver);
            Ok(())
        }

        async fn on_deactivate(&mut self, receiver: &Receiver) -> Result<(), Error> {
            self.record("deactivate", receiver);
            Ok(())
        }

        async fn on_terminate(&mut self, receiver: &Receiver) -> Result<(), Error> {
            self.record("terminate", receiver);
            Ok(())
        }
    }

    struct Slow {
        trace: Trace,
        started: Arc<Notify>,
    }

    #[async_trait]
    impl MessageHandler for Slow {
        async fn handle(
            &self,
            _content: &[u8],
            _message: &Envelope,
            _ctx: &RequestContext,
        ) -> Result<(), Error> {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.trace.lock().unwrap().push("handled".to_owned());
            Ok(())
        }
    }

    fn receiver(broker: &MemoryBroker, process: &Arc<Process>) -> Receiver {
        let mailbox = MailboxHandle::new("jobs", Scope::System, process.system()).unwrap();
        Receiver::builder("jobs", mailbox, SharedWork).build(process, Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn test_deactivate_drains_before_hook() {
        let broker = MemoryBroker::new();
        let process = Process::new("p1", SystemId::new("test", "c1"));
        let trace = Trace::default();
        let started = Arc::new(Notify::new());
        let receiver = receiver(&broker, &process);
        receiver.add_handler(Slow {
            trace: trace.clone(),
            started: started.clone(),
        });

        let mut service = ServiceProcess::new(
            Recording {
                trace: trace.clone(),
                fail_init: false,
            },
            receiver,
        );
        service.init().await.unwrap();
        service.activate().await.unwrap();
        broker
            .publish(&Envelope::new("test.jobs").with_id("m1"))
            .await
            .unwrap();
        started.notified().await;

        service.deactivate().await.unwrap();
        service.terminate().await.unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec![
                "init NEW 0",
                "activate READY 0",
                "handled",
                "deactivate INACTIVE 0",
                "deactivate INACTIVE 0",
                "terminate INACTIVE 0",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_init_skips_receiver() {
        let broker = MemoryBroker::new();
        let process = Process::new("p1", SystemId::new("test", "c1"));
        let trace = Trace::default();
        let mut service = ServiceProcess::new(
            Recording {
                trace: trace.clone(),
                fail_init: true,
            },
            receiver(&broker, &process),
        );

        assert_eq!(
            service.init().await,
            Err(Error::Service("no database".to_owned()))
        );
        assert_eq!(service.receiver().state(), ReceiverState::New);
        assert_eq!(broker.queue_depth("test.jobs"), None);
        assert!(service.service().fail_init);
    }
}
