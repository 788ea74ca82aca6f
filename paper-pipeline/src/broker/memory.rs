//! In-process broker with topic routing, prefetch-1 consumption, requeue and
//! dead-lettering. Backs the test suite and local dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::error::BrokerError;
use super::message::{Payload, decode_payload};
use super::topology::{DEFAULT_EXCHANGE, QueueBinding, RoutingKey, Topology, topic_matches};
use super::transport::{Acknowledger, Delivery, Subscription, Transport};

/// A message as it was handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub attempt: u32,
    /// Set on retries sent through [`Transport::republish`].
    pub origin_routing_key: Option<String>,
}

impl PublishedMessage {
    #[must_use]
    pub fn payload(&self) -> Option<Payload> {
        decode_payload(&self.body).ok()
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    routing_key: String,
    attempt: u32,
    redelivered: bool,
}

#[derive(Debug)]
struct MemoryQueue {
    messages: VecDeque<StoredMessage>,
    dead_letter: Option<(String, String)>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    fn new(dead_letter: Option<(String, String)>) -> Self {
        Self {
            messages: VecDeque::new(),
            dead_letter,
            notify: Arc::new(Notify::new()),
        }
    }

    fn push_back(&mut self, message: StoredMessage) {
        self.messages.push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&mut self, message: StoredMessage) {
        self.messages.push_front(message);
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct ExchangeBinding {
    exchange: String,
    pattern: String,
    queue: String,
}

#[derive(Debug, Default)]
struct State {
    bindings: Vec<ExchangeBinding>,
    queues: HashMap<String, MemoryQueue>,
    published: Vec<PublishedMessage>,
    failing_publishes: usize,
    closed: bool,
}

impl State {
    fn ensure_queue(&mut self, name: &str, dead_letter: Option<(String, String)>) {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| MemoryQueue::new(dead_letter));
    }

    fn ensure_binding(&mut self, exchange: &str, pattern: &str, queue: &str) {
        let exists = self.bindings.iter().any(|binding| {
            binding.exchange == exchange && binding.pattern == pattern && binding.queue == queue
        });
        if !exists {
            self.bindings.push(ExchangeBinding {
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
                queue: queue.to_string(),
            });
        }
    }

    fn declare_binding(&mut self, topology: &Topology, binding: &QueueBinding) {
        self.ensure_queue(
            &binding.queue,
            Some((
                topology.dead_letter_exchange().to_string(),
                binding.queue.clone(),
            )),
        );
        self.ensure_binding(topology.exchange(), &binding.binding_key, &binding.queue);

        let dead_letter_queue = binding.dead_letter_queue();
        self.ensure_queue(&dead_letter_queue, None);
        self.ensure_binding(
            topology.dead_letter_exchange(),
            &binding.queue,
            &dead_letter_queue,
        );
    }

    fn accept(
        &mut self,
        exchange: &str,
        routing_key: &str,
        origin_routing_key: Option<&str>,
        body: &[u8],
        attempt: u32,
    ) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if self.failing_publishes > 0 {
            self.failing_publishes -= 1;
            return Err(BrokerError::Rejected(format!(
                "injected failure for {routing_key}"
            )));
        }

        self.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            attempt,
            origin_routing_key: origin_routing_key.map(str::to_string),
        });
        let message = StoredMessage {
            body: body.to_vec(),
            routing_key: origin_routing_key.unwrap_or(routing_key).to_string(),
            attempt,
            redelivered: false,
        };
        self.route(exchange, routing_key, &message);
        Ok(())
    }

    /// Unroutable messages are dropped, as on a real broker without an alternate exchange.
    fn route(&mut self, exchange: &str, routing_key: &str, message: &StoredMessage) {
        if exchange == DEFAULT_EXCHANGE {
            if let Some(queue) = self.queues.get_mut(routing_key) {
                queue.push_back(message.clone());
            }
            return;
        }

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|binding| {
                binding.exchange == exchange && topic_matches(&binding.pattern, routing_key)
            })
            .map(|binding| binding.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();
        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.push_back(message.clone());
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message accepted by `publish`, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.lock().published.clone()
    }

    /// Payloads published to the pipeline exchange under `key`.
    #[must_use]
    pub fn published_payloads(&self, key: RoutingKey) -> Vec<Payload> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|message| {
                message.exchange != DEFAULT_EXCHANGE && message.routing_key == key.as_str()
            })
            .filter_map(PublishedMessage::payload)
            .collect()
    }

    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.messages.len())
    }

    /// Payloads waiting in `queue`, head first.
    #[must_use]
    pub fn queued_payloads(&self, queue: &str) -> Vec<Payload> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|queue| {
                queue
                    .messages
                    .iter()
                    .filter_map(|message| decode_payload(&message.body).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Makes the next `count` publishes fail with [`BrokerError::Rejected`].
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.lock().failing_publishes = count;
    }

    /// Pushes a raw body straight into a queue, bypassing the producer.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        target.push_back(StoredMessage {
            body: body.into(),
            routing_key: queue.to_string(),
            attempt: 1,
            redelivered: false,
        });
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        for binding in topology.bindings() {
            state.declare_binding(topology, binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        attempt: u32,
    ) -> Result<(), BrokerError> {
        self.inner
            .lock()
            .accept(exchange, routing_key, None, body, attempt)
    }

    async fn republish(
        &self,
        queue: &str,
        origin_routing_key: &str,
        body: &[u8],
        attempt: u32,
    ) -> Result<(), BrokerError> {
        self.inner.lock().accept(
            DEFAULT_EXCHANGE,
            queue,
            Some(origin_routing_key),
            body,
            attempt,
        )
    }

    async fn subscribe(
        &self,
        topology: &Topology,
        binding: &QueueBinding,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state.declare_binding(topology, binding);
        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            queue: binding.queue.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        state.closed = true;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
            queue.notify.notify_one();
        }
        Ok(())
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    queue: String,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            let notify = {
                let mut state = self.inner.lock();
                if state.closed {
                    return None;
                }
                let queue = state.queues.get_mut(&self.queue)?;
                if let Some(message) = queue.messages.pop_front() {
                    let acker = MemoryAcker {
                        inner: Arc::clone(&self.inner),
                        queue: self.queue.clone(),
                        message: message.clone(),
                        settled: AtomicBool::new(false),
                    };
                    return Some(Ok(Delivery::new(
                        message.body,
                        message.routing_key,
                        message.redelivered,
                        message.attempt,
                        Box::new(acker),
                    )));
                }
                Arc::clone(&queue.notify)
            };
            notify.notified().await;
        }
    }
}

/// Requeues its message on drop when never settled, like a dropped AMQP channel.
struct MemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    message: StoredMessage,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }

    fn requeue(&self) {
        let mut state = self.inner.lock();
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            let mut message = self.message.clone();
            message.redelivered = true;
            queue.push_front(message);
        }
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle();
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        if !self.settle() {
            return Ok(());
        }
        if requeue {
            self.requeue();
            return Ok(());
        }

        let mut state = self.inner.lock();
        let dead_letter = state
            .queues
            .get(&self.queue)
            .and_then(|queue| queue.dead_letter.clone());
        if let Some((exchange, routing_key)) = dead_letter {
            state.route(&exchange, &routing_key, &self.message);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if self.settle() {
            self.requeue();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::topology::PIPELINE_EXCHANGE;

    async fn transport_with_topology() -> (MemoryTransport, Topology) {
        let transport = MemoryTransport::new();
        let topology = Topology::pipeline();
        transport.declare(&topology).await.expect("declare");
        (transport, topology)
    }

    #[tokio::test]
    async fn publish_routes_by_topic_binding() {
        let (transport, _) = transport_with_topology().await;

        transport
            .publish(PIPELINE_EXCHANGE, "summarize.request", b"{}", 1)
            .await
            .expect("publish");

        assert_eq!(transport.queue_depth("summarizer"), 1);
        assert_eq!(transport.queue_depth("publisher-drafts"), 0);
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let (transport, _) = transport_with_topology().await;

        transport
            .publish(DEFAULT_EXCHANGE, "publisher-schedule", b"{}", 2)
            .await
            .expect("publish");

        assert_eq!(transport.queue_depth("publisher-schedule"), 1);
    }

    #[tokio::test]
    async fn nack_without_requeue_moves_to_dead_letter_queue() {
        let (transport, topology) = transport_with_topology().await;
        let binding = topology
            .binding_for(RoutingKey::SummarizeRequest)
            .expect("binding")
            .clone();
        let mut subscription = transport.subscribe(&topology, &binding).await.expect("subscribe");
        transport
            .publish(PIPELINE_EXCHANGE, "summarize.request", br#"{"k":1}"#, 1)
            .await
            .expect("publish");

        let delivery = subscription.next_delivery().await.expect("some").expect("ok");
        delivery.nack(false).await.expect("nack");

        assert_eq!(transport.queue_depth("summarizer"), 0);
        assert_eq!(transport.queue_depth("summarizer.dead"), 1);
    }

    #[tokio::test]
    async fn unsettled_delivery_is_redelivered_on_drop() {
        let (transport, topology) = transport_with_topology().await;
        let binding = topology
            .binding_for(RoutingKey::PublicationSchedule)
            .expect("binding")
            .clone();
        let mut subscription = transport.subscribe(&topology, &binding).await.expect("subscribe");
        transport
            .publish(PIPELINE_EXCHANGE, "publication.schedule", b"{}", 1)
            .await
            .expect("publish");

        let first = subscription.next_delivery().await.expect("some").expect("ok");
        assert!(!first.redelivered);
        drop(first);

        let second = subscription.next_delivery().await.expect("some").expect("ok");
        assert!(second.redelivered);
        second.ack().await.expect("ack");
        assert_eq!(transport.queue_depth("publisher-schedule"), 0);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let (transport, _) = transport_with_topology().await;
        transport.fail_next_publishes(1);

        assert!(transport.publish(PIPELINE_EXCHANGE, "crawl.start", b"{}", 1).await.is_err());
        assert!(transport.publish(PIPELINE_EXCHANGE, "crawl.start", b"{}", 1).await.is_ok());
        assert_eq!(transport.published().len(), 1);
    }
}
