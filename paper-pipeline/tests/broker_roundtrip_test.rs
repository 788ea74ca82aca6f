mod common;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use paper_pipeline::broker::{
    Acknowledger, Broker, BrokerError, Delivery, DeliveryContext, MAX_CONSECUTIVE_STREAM_ERRORS,
    MessageHandler, Payload, QueueBinding, RetryPolicy, RoutingKey, Subscription, Topology,
    Transport, join_consumers, payload_timestamp,
};

use common::eventually;

/// Fails the first `fail_first` calls, then succeeds.
struct RecordingHandler {
    fail_first: u32,
    calls: AtomicU32,
    seen: Mutex<Vec<(Payload, DeliveryContext)>>,
}

impl RecordingHandler {
    fn new(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen(&self) -> Vec<(Payload, DeliveryContext)> {
        self.seen.lock().expect("seen").clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, payload: &Payload, context: &DeliveryContext) -> anyhow::Result<()> {
        self.seen
            .lock()
            .expect("seen")
            .push((payload.clone(), context.clone()));
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            anyhow::bail!("transient failure {call}");
        }
        Ok(())
    }
}

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().expect("object")
}

#[tokio::test]
async fn published_payload_arrives_with_generation_timestamp() {
    let (broker, _transport) = Broker::in_memory().await.expect("broker");
    let handler = RecordingHandler::new(0);
    let shutdown = CancellationToken::new();
    let key = RoutingKey::SummarizeRequest;
    let consumer = broker.subscribe(
        key.default_queue(),
        key,
        handler.clone(),
        RetryPolicy::new(3, 0, 0),
        shutdown.clone(),
    );

    broker
        .producer()
        .publish(key, payload(json!({"a": 1, "b": "x"})))
        .await
        .expect("publish");

    assert!(eventually(|| handler.calls() == 1).await);
    shutdown.cancel();
    consumer.await.expect("join").expect("consumer");

    let (received, context) = handler.seen().pop().expect("delivery");
    assert_eq!(received["a"], json!(1));
    assert_eq!(received["b"], json!("x"));
    assert!(payload_timestamp(&received).is_some());
    assert_eq!(context.attempt, 1);
    assert_eq!(context.routing_key, "summarize.request");
}

#[tokio::test]
async fn failed_message_is_redelivered_and_success_is_not() {
    let (broker, transport) = Broker::in_memory().await.expect("broker");
    let handler = RecordingHandler::new(1);
    let shutdown = CancellationToken::new();
    let key = RoutingKey::PublicationDraftRequest;
    let consumer = broker.subscribe(
        key.default_queue(),
        key,
        handler.clone(),
        RetryPolicy::new(3, 0, 0),
        shutdown.clone(),
    );

    broker
        .producer()
        .publish(key, payload(json!({"summaryId": "s", "publicationId": "p"})))
        .await
        .expect("publish");

    assert!(eventually(|| handler.calls() >= 2).await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    shutdown.cancel();
    consumer.await.expect("join").expect("consumer");

    let attempts: Vec<u32> = handler.seen().iter().map(|(_, context)| context.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    assert!(
        handler
            .seen()
            .iter()
            .all(|(_, context)| context.routing_key == "publication.draft.request")
    );
    assert_eq!(transport.queue_depth("publisher-drafts"), 0);
    assert_eq!(transport.queue_depth("publisher-drafts.dead"), 0);
}

#[tokio::test]
async fn exhausted_message_lands_in_dead_letter_queue() {
    let (broker, transport) = Broker::in_memory().await.expect("broker");
    let handler = RecordingHandler::new(u32::MAX);
    let shutdown = CancellationToken::new();
    let key = RoutingKey::PublicationSchedule;
    let consumer = broker.subscribe(
        key.default_queue(),
        key,
        handler.clone(),
        RetryPolicy::new(3, 0, 0),
        shutdown.clone(),
    );

    broker
        .producer()
        .publish(key, payload(json!({"publicationId": "p", "summaryId": "s"})))
        .await
        .expect("publish");

    assert!(eventually(|| transport.queue_depth("publisher-schedule.dead") == 1).await);
    shutdown.cancel();
    consumer.await.expect("join").expect("consumer");

    assert_eq!(handler.calls(), 3);
    assert_eq!(transport.queue_depth("publisher-schedule"), 0);
    let dead = transport.queued_payloads("publisher-schedule.dead");
    assert_eq!(dead[0]["publicationId"], json!("p"));
}

#[tokio::test]
async fn unbounded_mode_requeues_until_success() {
    let (broker, transport) = Broker::in_memory().await.expect("broker");
    let handler = RecordingHandler::new(2);
    let shutdown = CancellationToken::new();
    let key = RoutingKey::CrawlStart;
    let consumer = broker.subscribe(
        key.default_queue(),
        key,
        handler.clone(),
        RetryPolicy::unbounded(),
        shutdown.clone(),
    );

    broker
        .producer()
        .publish(key, payload(json!({"sourceId": "s", "schedule": "3:00-5:00"})))
        .await
        .expect("publish");

    assert!(eventually(|| handler.calls() == 3).await);
    shutdown.cancel();
    consumer.await.expect("join").expect("consumer");

    let seen = handler.seen();
    assert!(!seen[0].1.redelivered);
    assert!(seen[1].1.redelivered);
    assert!(seen.iter().all(|(_, context)| context.attempt == 1));
    assert_eq!(transport.queue_depth("crawler.dead"), 0);
}

#[tokio::test]
async fn malformed_body_is_dropped_without_calling_handler() {
    let (broker, transport) = Broker::in_memory().await.expect("broker");
    let handler = RecordingHandler::new(0);
    let shutdown = CancellationToken::new();
    let key = RoutingKey::SummarizeRequest;
    let consumer = broker.subscribe(
        key.default_queue(),
        key,
        handler.clone(),
        RetryPolicy::new(3, 0, 0),
        shutdown.clone(),
    );

    transport.inject("summarizer", "not json").expect("inject");
    assert!(eventually(|| transport.queue_depth("summarizer") == 0).await);
    broker
        .producer()
        .publish(key, payload(json!({"articleId": "a"})))
        .await
        .expect("publish");
    assert!(eventually(|| handler.calls() == 1).await);
    shutdown.cancel();
    consumer.await.expect("join").expect("consumer");

    assert_eq!(handler.seen()[0].0["articleId"], json!("a"));
    assert_eq!(transport.queue_depth("summarizer.dead"), 0);
}

#[tokio::test]
async fn nested_payload_is_rejected_before_publish() {
    let (broker, transport) = Broker::in_memory().await.expect("broker");

    let result = broker
        .producer()
        .publish(RoutingKey::SummarizeRequest, payload(json!({"meta": {"k": 1}})))
        .await;

    assert!(result.is_err());
    assert!(transport.published().is_empty());
}

/// Transport that replays a fixed script of stream items and can fail acks.
#[derive(Clone, Default)]
struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Result<&'static str, &'static str>>>>,
    failing_acks: Arc<AtomicU32>,
    acked: Arc<AtomicU32>,
    close_when_drained: bool,
}

impl ScriptedTransport {
    fn new(items: Vec<Result<&'static str, &'static str>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(items.into())),
            ..Self::default()
        }
    }

    fn failing_acks(self, count: u32) -> Self {
        self.failing_acks.store(count, Ordering::SeqCst);
        self
    }

    fn close_when_drained(mut self) -> Self {
        self.close_when_drained = true;
        self
    }

    fn acked(&self) -> u32 {
        self.acked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn declare(&self, _topology: &Topology) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn publish(&self, _: &str, _: &str, _: &[u8], _: u32) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn republish(&self, _: &str, _: &str, _: &[u8], _: u32) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn subscribe(
        &self,
        _topology: &Topology,
        _binding: &QueueBinding,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        Ok(Box::new(self.clone()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[async_trait]
impl Subscription for ScriptedTransport {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let item = self.script.lock().expect("script").pop_front();
        match item {
            Some(Ok(body)) => Some(Ok(Delivery::new(
                body.as_bytes().to_vec(),
                "summarize.request",
                false,
                1,
                Box::new(ScriptedAcker {
                    failing_acks: Arc::clone(&self.failing_acks),
                    acked: Arc::clone(&self.acked),
                }),
            ))),
            Some(Err(reason)) => Some(Err(BrokerError::Rejected(reason.to_string()))),
            None if self.close_when_drained => None,
            None => std::future::pending().await,
        }
    }
}

struct ScriptedAcker {
    failing_acks: Arc<AtomicU32>,
    acked: Arc<AtomicU32>,
}

#[async_trait]
impl Acknowledger for ScriptedAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        let fail = self
            .failing_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail {
            return Err(BrokerError::Rejected("ack lost".to_string()));
        }
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), BrokerError> {
        Ok(())
    }
}

async fn scripted_consumer(
    transport: ScriptedTransport,
    handler: Arc<RecordingHandler>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<Result<(), BrokerError>> {
    let broker = Broker::with_transport(Arc::new(transport), Topology::pipeline())
        .await
        .expect("broker");
    let key = RoutingKey::SummarizeRequest;
    broker.subscribe(
        key.default_queue(),
        key,
        handler,
        RetryPolicy::new(3, 0, 0),
        shutdown,
    )
}

const BODY: &str = r#"{"articleId":"a"}"#;

#[tokio::test]
async fn failed_ack_does_not_stop_the_consumer() {
    let transport = ScriptedTransport::new(vec![Ok(BODY), Ok(BODY), Ok(BODY)]).failing_acks(1);
    let handler = RecordingHandler::new(0);
    let shutdown = CancellationToken::new();
    let consumer = scripted_consumer(transport.clone(), handler.clone(), shutdown.clone()).await;

    assert!(eventually(|| handler.calls() == 3).await);
    shutdown.cancel();
    consumer.await.expect("join").expect("consumer");

    assert_eq!(transport.acked(), 2);
}

#[tokio::test]
async fn single_stream_error_is_skipped() {
    let transport = ScriptedTransport::new(vec![Err("channel hiccup"), Ok(BODY)]);
    let handler = RecordingHandler::new(0);
    let shutdown = CancellationToken::new();
    let consumer = scripted_consumer(transport.clone(), handler.clone(), shutdown.clone()).await;

    assert!(eventually(|| handler.calls() == 1).await);
    shutdown.cancel();
    consumer.await.expect("join").expect("consumer");

    assert_eq!(transport.acked(), 1);
}

#[tokio::test]
async fn persistent_stream_errors_stop_the_consumer() {
    let errors = (0..MAX_CONSECUTIVE_STREAM_ERRORS).map(|_| Err("channel gone")).collect();
    let transport = ScriptedTransport::new(errors);
    let handler = RecordingHandler::new(0);
    let consumer =
        scripted_consumer(transport, handler.clone(), CancellationToken::new()).await;

    let result = consumer.await.expect("join");

    assert!(matches!(result, Err(BrokerError::Rejected(_))));
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn subscription_ending_before_shutdown_is_an_error() {
    let transport = ScriptedTransport::new(vec![Ok(BODY)]).close_when_drained();
    let handler = RecordingHandler::new(0);
    let consumer =
        scripted_consumer(transport, handler.clone(), CancellationToken::new()).await;

    let result = consumer.await.expect("join");

    assert!(matches!(
        result,
        Err(BrokerError::SubscriptionEnded(queue)) if queue == "summarizer"
    ));
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn lost_consumer_fails_the_group_and_stops_the_rest() {
    let shutdown = CancellationToken::new();
    let healthy = scripted_consumer(
        ScriptedTransport::new(Vec::new()),
        RecordingHandler::new(0),
        shutdown.clone(),
    )
    .await;
    let lost = scripted_consumer(
        ScriptedTransport::new(Vec::new()).close_when_drained(),
        RecordingHandler::new(0),
        shutdown.clone(),
    )
    .await;

    let result = join_consumers(vec![healthy, lost], shutdown.clone()).await;

    let error = result.expect_err("lost consumer");
    assert!(format!("{error:#}").contains("ended before shutdown"));
    assert!(shutdown.is_cancelled());
}

#[tokio::test]
async fn consumers_stopped_by_shutdown_join_cleanly() {
    let shutdown = CancellationToken::new();
    let consumers = vec![
        scripted_consumer(
            ScriptedTransport::new(Vec::new()),
            RecordingHandler::new(0),
            shutdown.clone(),
        )
        .await,
        scripted_consumer(
            ScriptedTransport::new(Vec::new()),
            RecordingHandler::new(0),
            shutdown.clone(),
        )
        .await,
    ];
    shutdown.cancel();

    join_consumers(consumers, shutdown).await.expect("clean shutdown");
}
