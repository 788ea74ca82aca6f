use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::BrokerError;
use super::message::{Payload, decode_payload, payload_timestamp};
use super::retry::RetryPolicy;
use super::topology::{QueueBinding, Topology};
use super::transport::{Delivery, Transport};
use crate::observability::Telemetry;

/// Stream errors tolerated back to back before a consumer gives up.
pub const MAX_CONSECUTIVE_STREAM_ERRORS: u32 = 5;

/// Business logic behind one queue. Must tolerate redelivery of the same payload.
///
/// `Ok(())` acks. `Err` consumes one attempt of the retry budget.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &Payload, context: &DeliveryContext) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    pub queue: String,
    pub routing_key: String,
    /// 1-based.
    pub attempt: u32,
    /// 0 when retries are unbounded.
    pub max_attempts: u32,
    pub redelivered: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

impl DeliveryContext {
    #[must_use]
    pub fn is_final_attempt(&self) -> bool {
        self.max_attempts > 0 && self.attempt >= self.max_attempts
    }
}

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    /// Republished with the next attempt number, original acked.
    Retried,
    /// Nacked back onto the queue.
    Requeued,
    /// Nacked without requeue; the broker moved it to `<queue>.dead`.
    DeadLettered,
    /// Malformed body, acked without calling the handler.
    Dropped,
}

impl Settlement {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Retried => "retried",
            Self::Requeued => "requeued",
            Self::DeadLettered => "dead_lettered",
            Self::Dropped => "dropped",
        }
    }
}

/// Serial consumer for one queue (prefetch 1).
pub struct ConsumerWorker {
    transport: Arc<dyn Transport>,
    topology: Arc<Topology>,
    binding: QueueBinding,
    handler: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
    telemetry: Option<Telemetry>,
}

impl ConsumerWorker {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        topology: Arc<Topology>,
        binding: QueueBinding,
        handler: Arc<dyn MessageHandler>,
        policy: RetryPolicy,
        telemetry: Option<Telemetry>,
    ) -> Self {
        Self {
            transport,
            topology,
            binding,
            handler,
            policy,
            telemetry,
        }
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.binding.queue
    }

    /// Consumes until `shutdown` fires.
    ///
    /// Cancellation is only observed between deliveries; a running handler
    /// always completes and settles its message. A failed ack or nack is
    /// logged and the loop moves on: the broker still owns the message and
    /// redelivers it. The subscription ending before shutdown, or
    /// [`MAX_CONSECUTIVE_STREAM_ERRORS`] stream errors in a row, is an error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BrokerError> {
        let mut subscription = self.transport.subscribe(&self.topology, &self.binding).await?;
        info!(
            queue = %self.binding.queue,
            binding_key = %self.binding.binding_key,
            max_attempts = self.policy.max_attempts,
            "consumer started"
        );

        let mut stream_errors = 0_u32;
        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!(queue = %self.binding.queue, "consumer stopping on shutdown");
                    return Ok(());
                }
                next = subscription.next_delivery() => next,
            };

            let Some(next) = next else {
                if shutdown.is_cancelled() {
                    info!(queue = %self.binding.queue, "subscription closed on shutdown");
                    return Ok(());
                }
                error!(queue = %self.binding.queue, "subscription closed unexpectedly");
                return Err(BrokerError::SubscriptionEnded(self.binding.queue.clone()));
            };

            let delivery = match next {
                Ok(delivery) => {
                    stream_errors = 0;
                    delivery
                }
                Err(stream_error) => {
                    stream_errors += 1;
                    if stream_errors >= MAX_CONSECUTIVE_STREAM_ERRORS {
                        error!(
                            queue = %self.binding.queue,
                            error = %stream_error,
                            consecutive = stream_errors,
                            "consumer stream keeps failing; giving up"
                        );
                        return Err(stream_error);
                    }
                    warn!(
                        queue = %self.binding.queue,
                        error = %stream_error,
                        consecutive = stream_errors,
                        "consumer stream error"
                    );
                    continue;
                }
            };

            let outcome = match self.process(delivery).await {
                Ok(settlement) => settlement.as_str(),
                Err(settle_error) => {
                    warn!(
                        queue = %self.binding.queue,
                        error = %settle_error,
                        "failed to settle delivery; leaving it to the broker"
                    );
                    "settle_failed"
                }
            };
            if let Some(telemetry) = &self.telemetry {
                telemetry.record_delivery(&self.binding.queue, outcome);
            }
        }
    }

    /// Runs the handler for one delivery and settles it.
    pub async fn process(&self, delivery: Delivery) -> Result<Settlement, BrokerError> {
        let payload = match decode_payload(&delivery.body) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(
                    queue = %self.binding.queue,
                    error = %error,
                    body_len = delivery.body.len(),
                    "dropping malformed message"
                );
                delivery.ack().await?;
                return Ok(Settlement::Dropped);
            }
        };

        let context = DeliveryContext {
            queue: self.binding.queue.clone(),
            routing_key: delivery.routing_key.clone(),
            attempt: delivery.attempt,
            max_attempts: self.policy.max_attempts,
            redelivered: delivery.redelivered,
            timestamp: payload_timestamp(&payload),
        };

        let started = Instant::now();
        let result = self.handler.handle(&payload, &context).await;
        if let Some(telemetry) = &self.telemetry {
            telemetry.observe_handler(&self.binding.queue, started.elapsed().as_secs_f64());
        }

        match result {
            Ok(()) => {
                delivery.ack().await?;
                debug!(queue = %self.binding.queue, attempt = context.attempt, "message acked");
                Ok(Settlement::Acked)
            }
            Err(failure) => self.settle_failure(delivery, &context, &failure).await,
        }
    }

    async fn settle_failure(
        &self,
        delivery: Delivery,
        context: &DeliveryContext,
        failure: &anyhow::Error,
    ) -> Result<Settlement, BrokerError> {
        if !self.policy.is_bounded() {
            warn!(
                queue = %context.queue,
                error = %format_args!("{failure:#}"),
                "handler failed; requeueing"
            );
            delivery.nack(true).await?;
            return Ok(Settlement::Requeued);
        }

        if self.policy.is_final_attempt(context.attempt) {
            error!(
                queue = %context.queue,
                attempt = context.attempt,
                error = %format_args!("{failure:#}"),
                "handler failed on final attempt; dead-lettering"
            );
            delivery.nack(false).await?;
            return Ok(Settlement::DeadLettered);
        }

        let delay = self.policy.delay_after(context.attempt);
        warn!(
            queue = %context.queue,
            attempt = context.attempt,
            max_attempts = context.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %format_args!("{failure:#}"),
            "handler failed; scheduling retry"
        );
        tokio::time::sleep(delay).await;

        match self
            .transport
            .republish(
                &self.binding.queue,
                &context.routing_key,
                &delivery.body,
                context.attempt + 1,
            )
            .await
        {
            Ok(()) => {
                delivery.ack().await?;
                Ok(Settlement::Retried)
            }
            Err(publish_error) => {
                error!(
                    queue = %context.queue,
                    error = %publish_error,
                    "retry republish failed; requeueing original"
                );
                delivery.nack(true).await?;
                Ok(Settlement::Requeued)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::broker::memory::MemoryTransport;
    use crate::broker::topology::{DEFAULT_EXCHANGE, PIPELINE_EXCHANGE, RoutingKey};

    struct FailingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _payload: &Payload, _context: &DeliveryContext) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                anyhow::bail!("failure {call}");
            }
            Ok(())
        }
    }

    async fn worker(fail_first: u32, policy: RetryPolicy) -> (ConsumerWorker, MemoryTransport, Arc<FailingHandler>) {
        let transport = MemoryTransport::new();
        let topology = Arc::new(Topology::pipeline());
        transport.declare(&topology).await.expect("declare");
        let handler = Arc::new(FailingHandler {
            calls: AtomicU32::new(0),
            fail_first,
        });
        let worker = ConsumerWorker::new(
            Arc::new(transport.clone()),
            topology,
            QueueBinding::new("summarizer", RoutingKey::SummarizeRequest),
            handler.clone(),
            policy,
            None,
        );
        (worker, transport, handler)
    }

    async fn next(transport: &MemoryTransport, worker: &ConsumerWorker) -> Delivery {
        let topology = Topology::pipeline();
        let mut subscription = transport
            .subscribe(&topology, &worker.binding)
            .await
            .expect("subscribe");
        subscription.next_delivery().await.expect("delivery").expect("ok")
    }

    #[tokio::test]
    async fn failed_attempt_is_republished_with_next_attempt() {
        let (worker, transport, _) = worker(1, RetryPolicy::new(3, 0, 0)).await;
        transport
            .publish(PIPELINE_EXCHANGE, "summarize.request", br#"{"articleId":"x"}"#, 1)
            .await
            .expect("publish");

        let settlement = worker.process(next(&transport, &worker).await).await.expect("process");

        assert_eq!(settlement, Settlement::Retried);
        let republished = transport.published().pop().expect("republished");
        assert_eq!(republished.exchange, DEFAULT_EXCHANGE);
        assert_eq!(republished.routing_key, "summarizer");
        assert_eq!(republished.origin_routing_key.as_deref(), Some("summarize.request"));
        assert_eq!(republished.attempt, 2);
        assert_eq!(transport.queue_depth("summarizer"), 1);

        let retry = next(&transport, &worker).await;
        assert_eq!(retry.routing_key, "summarize.request");
        assert_eq!(retry.attempt, 2);
    }

    #[tokio::test]
    async fn final_attempt_is_dead_lettered() {
        let (worker, transport, _) = worker(u32::MAX, RetryPolicy::new(2, 0, 0)).await;
        transport
            .publish(DEFAULT_EXCHANGE, "summarizer", br#"{"articleId":"x"}"#, 2)
            .await
            .expect("publish");

        let settlement = worker.process(next(&transport, &worker).await).await.expect("process");

        assert_eq!(settlement, Settlement::DeadLettered);
        assert_eq!(transport.queue_depth("summarizer"), 0);
        assert_eq!(transport.queue_depth("summarizer.dead"), 1);
    }

    #[tokio::test]
    async fn unbounded_policy_requeues() {
        let (worker, transport, _) = worker(1, RetryPolicy::unbounded()).await;
        transport
            .publish(PIPELINE_EXCHANGE, "summarize.request", b"{}", 1)
            .await
            .expect("publish");

        let settlement = worker.process(next(&transport, &worker).await).await.expect("process");

        assert_eq!(settlement, Settlement::Requeued);
        assert_eq!(transport.queue_depth("summarizer"), 1);
        assert!(next(&transport, &worker).await.redelivered);
    }

    #[tokio::test]
    async fn failed_republish_falls_back_to_requeue() {
        let (worker, transport, _) = worker(1, RetryPolicy::new(3, 0, 0)).await;
        transport
            .publish(PIPELINE_EXCHANGE, "summarize.request", b"{}", 1)
            .await
            .expect("publish");
        let delivery = next(&transport, &worker).await;
        transport.fail_next_publishes(1);

        let settlement = worker.process(delivery).await.expect("process");

        assert_eq!(settlement, Settlement::Requeued);
        assert_eq!(transport.queue_depth("summarizer"), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_dropped_without_calling_handler() {
        let (worker, transport, handler) = worker(0, RetryPolicy::default()).await;
        transport.inject("summarizer", "not json").expect("inject");

        let settlement = worker.process(next(&transport, &worker).await).await.expect("process");

        assert_eq!(settlement, Settlement::Dropped);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.queue_depth("summarizer"), 0);
    }

    #[test]
    fn context_reports_final_attempt() {
        let mut context = DeliveryContext {
            queue: "summarizer".into(),
            routing_key: "summarize.request".into(),
            attempt: 3,
            max_attempts: 3,
            redelivered: false,
            timestamp: None,
        };
        assert!(context.is_final_attempt());

        context.max_attempts = 0;
        assert!(!context.is_final_attempt());
    }
}
