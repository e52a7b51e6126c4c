// Integration tests for conversation context tracking

use receiver::{
    Envelope, Error, MailboxHandle, MemoryBroker, MessageHandler, NO_CONVERSATION, Process,
    RPC_PROTOCOL, Receiver, RequestContext, Scope, ScopeRule, SharedWork, SystemId, Transport,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn contains(&self, prefix: &str) -> bool {
        self.0
            .lock()
            .unwrap()
            .iter()
            .any(|entry| entry.starts_with(prefix))
    }
}

#[derive(Clone, Default)]
struct Gates(Arc<Mutex<HashMap<String, Arc<Notify>>>>);

impl Gates {
    fn gate(&self, id: &str) -> Arc<Notify> {
        self.0
            .lock()
            .unwrap()
            .entry(id.to_owned())
            .or_default()
            .clone()
    }
}

// Records `id [stack] conversation cached` and holds messages whose op is `wait`.
struct Recorder {
    gates: Gates,
    journal: Journal,
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(
        &self,
        _content: &[u8],
        message: &Envelope,
        ctx: &RequestContext,
    ) -> Result<(), Error> {
        let id = ctx.message_id().as_str();
        if ctx.scope_rule() == ScopeRule::Open && ctx.conversation().is_some() {
            ctx.cache_put("opened-by", id.as_bytes())?;
        }
        let cached = ctx
            .cache_get("opened-by")
            .map(|value| String::from_utf8_lossy(&value).into_owned())
            .unwrap_or_default();
        self.journal.0.lock().unwrap().push(format!(
            "{} [{}] {} {}",
            id,
            ctx.process().contexts().snapshot().join(","),
            ctx.conversation().unwrap_or("-"),
            cached
        ));
        if message.op.as_deref() == Some("wait") {
            self.gates.gate(id).notified().await;
        }
        Ok(())
    }
}

fn setup() -> (MemoryBroker, Arc<Process>, Receiver, Gates, Journal) {
    let broker = MemoryBroker::new();
    let process = Process::new("p1", SystemId::new("test", "c1"));
    let mailbox = MailboxHandle::new("jobs", Scope::System, process.system()).unwrap();
    let receiver =
        Receiver::builder("jobs", mailbox, SharedWork).build(&process, Arc::new(broker.clone()));
    let gates = Gates::default();
    let journal = Journal::default();
    receiver.add_handler(Recorder {
        gates: gates.clone(),
        journal: journal.clone(),
    });
    (broker, process, receiver, gates, journal)
}

fn rpc(id: &str, conv_id: &str, performative: &str) -> Envelope {
    Envelope::new("test.jobs")
        .with_id(id)
        .with_conversation(conv_id)
        .with_protocol(RPC_PROTOCOL)
        .with_performative(performative)
}

async fn until(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_request_opens_scope_and_result_inherits_it() {
    let (broker, process, receiver, gates, journal) = setup();
    receiver.attach().await.unwrap();

    broker
        .publish(&Envelope::request("test.jobs", "wait", "c1").with_id("m1"))
        .await
        .unwrap();
    until(|| journal.contains("m1")).await;
    assert_eq!(process.contexts().depth(), 1);

    broker.publish(&rpc("m2", "c1", "result")).await.unwrap();
    until(|| journal.contains("m2") && receiver.in_flight() == 1).await;
    assert_eq!(process.contexts().depth(), 1);
    assert!(process.caches().contains("c1"));

    gates.gate("m1").notify_one();
    until(|| receiver.in_flight() == 0).await;

    assert_eq!(journal.entries(), vec!["m1 [c1] c1 m1", "m2 [c1] c1 m1"]);
    assert_eq!(process.contexts().depth(), 0);
    assert!(!process.caches().contains("c1"));
}

#[tokio::test]
async fn test_malformed_rpc_falls_back_to_current_context() {
    let (broker, process, receiver, gates, journal) = setup();
    receiver.attach().await.unwrap();

    broker.publish(&rpc("f1", "c7", "inform")).await.unwrap();
    until(|| journal.contains("f1") && receiver.in_flight() == 0).await;

    broker
        .publish(&Envelope::request("test.jobs", "wait", "c1").with_id("m1"))
        .await
        .unwrap();
    until(|| journal.contains("m1")).await;
    broker.publish(&rpc("f2", "c7", "confirm")).await.unwrap();
    until(|| journal.contains("f2") && receiver.in_flight() == 1).await;
    assert_eq!(process.contexts().snapshot(), vec!["c1"]);

    gates.gate("m1").notify_one();
    until(|| receiver.in_flight() == 0).await;

    assert_eq!(
        journal.entries(),
        vec![
            format!("f1 [] {} ", NO_CONVERSATION),
            "m1 [c1] c1 m1".to_owned(),
            "f2 [c1] c1 m1".to_owned(),
        ]
    );
    assert_eq!(process.contexts().depth(), 0);
}

#[tokio::test]
async fn test_nested_scopes_of_one_conversation() {
    let (broker, process, receiver, gates, journal) = setup();
    receiver.attach().await.unwrap();

    for id in ["a1", "a2"] {
        broker
            .publish(
                &Envelope::new("test.jobs")
                    .with_id(id)
                    .with_op("wait")
                    .with_conversation("c2"),
            )
            .await
            .unwrap();
        until(|| journal.contains(id)).await;
    }
    assert_eq!(process.contexts().snapshot(), vec!["c2", "c2"]);

    gates.gate("a1").notify_one();
    until(|| receiver.in_flight() == 1).await;
    assert_eq!(process.contexts().depth(), 1);
    assert!(process.caches().contains("c2"));

    gates.gate("a2").notify_one();
    until(|| receiver.in_flight() == 0).await;
    assert_eq!(process.contexts().depth(), 0);
    assert!(!process.caches().contains("c2"));
}

#[tokio::test]
async fn test_one_way_message_without_conversation() {
    let (broker, process, receiver, _gates, journal) = setup();
    receiver.attach().await.unwrap();

    broker
        .publish(&Envelope::new("test.jobs").with_id("n1"))
        .await
        .unwrap();
    until(|| journal.contains("n1") && receiver.in_flight() == 0).await;

    assert_eq!(journal.entries(), vec!["n1 [] - "]);
    assert_eq!(process.contexts().depth(), 0);
    assert!(process.caches().is_empty());
}
