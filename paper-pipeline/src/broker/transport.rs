use async_trait::async_trait;

use super::error::BrokerError;
use super::topology::{QueueBinding, Topology};

/// Header carrying the 1-based delivery attempt across retries.
pub const ATTEMPT_HEADER: &str = "x-pipeline-attempt";

/// Header carrying the routing key a retried message was first published under.
pub const ORIGIN_KEY_HEADER: &str = "x-pipeline-routing-key";

/// Seam between the pipeline and a concrete broker (AMQP or in-memory).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares exchanges, queues and bindings. Idempotent.
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError>;

    /// Hands a persistent message to the broker without waiting for a confirm.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        attempt: u32,
    ) -> Result<(), BrokerError>;

    /// Sends a retry straight to `queue` through the default exchange. Deliveries
    /// of it report `origin_routing_key` rather than the queue name.
    async fn republish(
        &self,
        queue: &str,
        origin_routing_key: &str,
        body: &[u8],
        attempt: u32,
    ) -> Result<(), BrokerError>;

    /// Declares and binds `binding.queue`, then starts consuming with prefetch 1.
    async fn subscribe(
        &self,
        topology: &Topology,
        binding: &QueueBinding,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// `None` once the consumer is cancelled or the transport closed.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// One consumed message. Settle it exactly once with `ack` or `nack`.
pub struct Delivery {
    pub body: Vec<u8>,
    /// Key of the first publish, also on retries.
    pub routing_key: String,
    pub redelivered: bool,
    pub attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    #[must_use]
    pub fn new(
        body: Vec<u8>,
        routing_key: impl Into<String>,
        redelivered: bool,
        attempt: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            redelivered,
            attempt: attempt.max(1),
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("attempt", &self.attempt)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}
