// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Handlers
//!
//! Service code plugs into a receiver through `MessageHandler` and `ErrorHandler`. Both get the
//! message content as produced by the inbound interceptor chain, the raw envelope, and a
//! `RequestContext`. The context carries the conversation the message runs in, explicitly, down
//! the call chain, together with an `Outbox` to send replies.
//!

use crate::{
    Error,
    envelope::{Envelope, MessageId, RPC_PROTOCOL, ScopeRule},
    interceptor::{Direction, InterceptorChain, Invocation, InvocationStatus},
    process::Process,
    transport::Transport,
};

use async_trait::async_trait;

use tracing::{debug, warn};

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

/// Performative of a successful RPC reply.
pub const INFORM_RESULT: &str = "inform-result";

/// Performative of a failed RPC reply.
pub const FAILURE: &str = "failure";

/// Header carrying the status code of a reply.
pub const STATUS_CODE: &str = "status-code";

/// Why the inbound chain refused a message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rejection {
    pub code: u16,
    pub reason: String,
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        Error::Rejected {
            code: rejection.code,
            reason: rejection.reason,
        }
    }
}

/// Handler invoked for every message accepted by the interceptor chain.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        content: &[u8],
        message: &Envelope,
        ctx: &RequestContext,
    ) -> Result<(), Error>;
}

/// Handler invoked for every message rejected by the interceptor chain.
#[async_trait]
pub trait ErrorHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        content: &[u8],
        message: &Envelope,
        rejection: &Rejection,
        ctx: &RequestContext,
    ) -> Result<(), Error>;
}

/// Outbound path of a receiver.
///
/// Fills in the sender and the message identity, runs the outbound interceptor chain and hands
/// the result to the transport unless the chain dropped it.
#[derive(Clone)]
pub struct Outbox {
    sender: String,
    instance: String,
    transport: Arc<dyn Transport>,
    chain: InterceptorChain,
    process: Weak<Process>,
    sequence: Arc<AtomicU64>,
}

impl Outbox {
    pub(crate) fn new(
        sender: &str,
        instance: &str,
        transport: Arc<dyn Transport>,
        chain: InterceptorChain,
        process: Weak<Process>,
    ) -> Self {
        Self {
            sender: sender.to_owned(),
            instance: instance.to_owned(),
            transport,
            chain,
            process,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sends `envelope`. Returns the envelope as routed, or `None` if the outbound chain
    /// dropped it.
    pub async fn send(&self, mut envelope: Envelope) -> Result<Option<Envelope>, Error> {
        if envelope.sender.is_none() {
            envelope.sender = Some(self.sender.clone());
        }
        if envelope.message_id.is_none() {
            let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            envelope.message_id = Some(MessageId::new(&format!("{}-{}", self.instance, n)));
        }

        let invocation = self
            .chain
            .run(Invocation::new(
                Direction::Outbound,
                envelope,
                self.process.clone(),
            ))
            .await;
        let mut envelope = invocation.message;
        envelope.content = invocation.content;
        match invocation.status {
            InvocationStatus::Drop => {
                debug!("Outbound message to {} dropped.", envelope.receiver);
                return Ok(None);
            }
            InvocationStatus::Reject { code, reason } => {
                warn!(
                    "Outbound message to {} flagged with {} ({}), sending anyway.",
                    envelope.receiver, code, reason
                );
            }
            InvocationStatus::Process => {}
        }
        self.transport.publish(&envelope).await?;
        Ok(Some(envelope))
    }
}

/// Per-message context handed to handlers.
#[derive(Clone)]
pub struct RequestContext {
    receiver: String,
    message_id: MessageId,
    conversation: Option<String>,
    rule: ScopeRule,
    request: Arc<Envelope>,
    process: Arc<Process>,
    outbox: Outbox,
}

impl RequestContext {
    pub(crate) fn new(
        receiver: &str,
        message_id: MessageId,
        conversation: Option<String>,
        request: Envelope,
        process: Arc<Process>,
        outbox: Outbox,
    ) -> Self {
        let rule = request.scope_rule();
        Self {
            receiver: receiver.to_owned(),
            message_id,
            conversation,
            rule,
            request: Arc::new(request),
            process,
            outbox,
        }
    }

    /// Label of the receiver processing the message.
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Conversation the message runs in.
    pub fn conversation(&self) -> Option<&str> {
        self.conversation.as_deref()
    }

    pub fn scope_rule(&self) -> ScopeRule {
        self.rule
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Stores a value in the cache of the current conversation.
    pub fn cache_put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let conversation = self
            .conversation
            .as_deref()
            .ok_or_else(|| Error::Handler("Message has no conversation".to_owned()))?;
        self.process.caches().put(conversation, key, value);
        Ok(())
    }

    /// Reads a value from the cache of the current conversation.
    pub fn cache_get(&self, key: &str) -> Option<Vec<u8>> {
        self.conversation
            .as_deref()
            .and_then(|conversation| self.process.caches().get(conversation, key))
    }

    /// Sends a message through the receiver's outbound path.
    pub async fn send(&self, envelope: Envelope) -> Result<Option<Envelope>, Error> {
        self.outbox.send(envelope).await
    }

    /// Answers the message being processed with `performative` and `content`.
    pub async fn reply(
        &self,
        performative: &str,
        content: &[u8],
    ) -> Result<Option<Envelope>, Error> {
        let to = self
            .request
            .sender
            .as_deref()
            .ok_or_else(|| Error::Send(format!("Message {} has no sender", self.message_id)))?;
        let mut reply = Envelope::new(to)
            .with_protocol(self.request.protocol.as_deref().unwrap_or(RPC_PROTOCOL))
            .with_performative(performative)
            .with_content(content);
        reply.conv_id = self.request.conv_id.clone();
        reply.op = self.request.op.clone();
        reply.encoding = self.request.encoding.clone();
        self.outbox.send(reply).await
    }
}

/// Error handler answering a rejected RPC request with a `failure` reply carrying the rejection
/// code. Rejected one-way messages are ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplyOnReject;

#[async_trait]
impl ErrorHandler for ReplyOnReject {
    async fn handle(
        &self,
        _content: &[u8],
        message: &Envelope,
        rejection: &Rejection,
        ctx: &RequestContext,
    ) -> Result<(), Error> {
        if !message.is_request() {
            return Ok(());
        }
        let to = message
            .sender
            .as_deref()
            .ok_or_else(|| Error::Send(format!("Message {} has no sender", ctx.message_id())))?;
        let mut reply = Envelope::new(to)
            .with_protocol(RPC_PROTOCOL)
            .with_performative(FAILURE)
            .with_header(STATUS_CODE, &rejection.code.to_string())
            .with_content(rejection.reason.as_bytes());
        reply.conv_id = message.conv_id.clone();
        reply.op = message.op.clone();
        ctx.send(reply).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::{
        interceptor::Interceptor,
        mailbox::SystemId,
        memory::MemoryBroker,
        topology::{DIRECT_EXCHANGE, Declaration, ExchangeKind},
    };

    struct Silence;

    #[async_trait]
    impl Interceptor for Silence {
        async fn process(&self, mut invocation: Invocation) -> Invocation {
            if invocation.message.op.as_deref() == Some("secret") {
                invocation.status = InvocationStatus::Drop;
            }
            invocation
        }
    }

    async fn broker_with_queue(name: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker
            .declare(&Declaration {
                exchange: DIRECT_EXCHANGE.to_owned(),
                kind: ExchangeKind::Direct,
                queue: name.to_owned(),
                routing_key: name.to_owned(),
                exclusive: false,
                durable: true,
            })
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn test_outbox_fills_headers() {
        let broker = broker_with_queue("test.peer").await;
        let outbox = Outbox::new(
            "test.me",
            "p1.me",
            Arc::new(broker.clone()),
            InterceptorChain::new(),
            Weak::new(),
        );
        let sent = outbox
            .send(Envelope::new("test.peer").with_op("ping"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.sender.as_deref(), Some("test.me"));
        assert_eq!(sent.message_id, Some(MessageId::new("p1.me-1")));
        assert_eq!(broker.queue_depth("test.peer"), Some((1, 0)));
    }

    #[tokio::test]
    async fn test_outbox_drop() {
        let broker = broker_with_queue("test.peer").await;
        let outbox = Outbox::new(
            "test.me",
            "p1.me",
            Arc::new(broker.clone()),
            InterceptorChain::new().with_outbound(Silence),
            Weak::new(),
        );
        let sent = outbox
            .send(Envelope::new("test.peer").with_op("secret"))
            .await
            .unwrap();
        assert!(sent.is_none());
        assert_eq!(broker.queue_depth("test.peer"), Some((0, 0)));
    }

    #[tokio::test]
    async fn test_reply_keeps_conversation() {
        let broker = broker_with_queue("test.client").await;
        let process = Process::new("p1", SystemId::new("test", "c1"));
        let outbox = Outbox::new(
            "test.server",
            "p1.server",
            Arc::new(broker.clone()),
            InterceptorChain::new(),
            Arc::downgrade(&process),
        );
        let request = Envelope::request("test.server", "add", "c9")
            .with_id("r1")
            .with_sender("test.client");
        let ctx = RequestContext::new(
            "server",
            MessageId::new("r1"),
            Some("c9".to_owned()),
            request,
            process,
            outbox,
        );
        let reply = ctx.reply(INFORM_RESULT, b"3").await.unwrap().unwrap();
        assert_eq!(reply.receiver, "test.client");
        assert_eq!(reply.conv_id.as_deref(), Some("c9"));
        assert_eq!(reply.op.as_deref(), Some("add"));
        assert_eq!(reply.scope_rule(), ScopeRule::Inherit);

        ctx.cache_put("partial", b"1").unwrap();
        assert_eq!(ctx.cache_get("partial"), Some(b"1".to_vec()));
    }

    #[test]
    fn test_rejection_into_error() {
        let error: Error = Rejection {
            code: 401,
            reason: "expired token".to_owned(),
        }
        .into();
        assert_eq!(error.to_string(), "Message rejected with code 401: expired token");
    }
}
