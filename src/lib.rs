//! Mailroom: inbound mailbox receivers for capability containers.
//! Re-exports the receiver crate, which holds the receiver state machine, the message pipeline,
//! the conversation context tracker and the service lifecycle binder.

pub use receiver::{
    Delivery, Direction, Envelope, Error, ErrorHandler, Exclusive, Fanout, Interceptor,
    InterceptorChain, Invocation, InvocationStatus, MailboxHandle, MailboxTopology,
    MemoryBroker, MessageHandler, MessageId, Process, ProcessFault, Receiver, ReceiverBuilder,
    ReceiverConfig, ReceiverState, ReplyOnReject, RequestContext, Scope, Service,
    ServiceProcess, SharedWork, Sink, Subscriber, SystemId, Transport,
};
