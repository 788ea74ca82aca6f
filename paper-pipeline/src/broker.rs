//! Topic-routed messaging: topology, producer, consumer workers and transports.

mod amqp;
mod consumer;
mod error;
mod memory;
mod message;
mod producer;
mod retry;
mod topology;
mod transport;

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use amqp::AmqpTransport;
pub use consumer::{
    ConsumerWorker, DeliveryContext, MAX_CONSECUTIVE_STREAM_ERRORS, MessageHandler, Settlement,
};
pub use error::BrokerError;
pub use memory::{MemoryTransport, PublishedMessage};
pub use message::{
    CrawlStart, DraftRequest, Payload, PipelineMessage, PublicationApproved, PublicationSchedule,
    SummarizeRequest, TIMESTAMP_FIELD, decode_payload, encode_payload, payload_timestamp,
    validate_flat,
};
pub use producer::Producer;
pub use retry::RetryPolicy;
pub use topology::{
    DEAD_LETTER_EXCHANGE, DEFAULT_EXCHANGE, PIPELINE_EXCHANGE, QueueBinding, RoutingKey, Topology,
    topic_matches,
};
pub use transport::{
    ATTEMPT_HEADER, Acknowledger, Delivery, ORIGIN_KEY_HEADER, Subscription, Transport,
};

use crate::config::Config;
use crate::observability::Telemetry;

/// Process-wide broker context: one transport shared by every producer and
/// consumer, acquired at start-up and closed at shutdown.
#[derive(Clone)]
pub struct Broker {
    transport: Arc<dyn Transport>,
    topology: Arc<Topology>,
    telemetry: Option<Telemetry>,
}

impl Broker {
    /// Connects to RabbitMQ and declares the pipeline topology.
    pub async fn connect(config: &Config) -> Result<Self, BrokerError> {
        let transport = AmqpTransport::connect(config.amqp_url()).await?;
        Self::with_transport(Arc::new(transport), Topology::pipeline()).await
    }

    pub async fn with_transport(
        transport: Arc<dyn Transport>,
        topology: Topology,
    ) -> Result<Self, BrokerError> {
        transport.declare(&topology).await?;
        Ok(Self {
            transport,
            topology: Arc::new(topology),
            telemetry: None,
        })
    }

    /// In-process broker plus a handle for inspecting it.
    pub async fn in_memory() -> Result<(Self, MemoryTransport), BrokerError> {
        let transport = MemoryTransport::new();
        let broker = Self::with_transport(Arc::new(transport.clone()), Topology::pipeline()).await?;
        Ok((broker, transport))
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    #[must_use]
    pub fn producer(&self) -> Producer {
        Producer::new(
            Arc::clone(&self.transport),
            self.topology.exchange(),
            self.telemetry.clone(),
        )
    }

    #[must_use]
    pub fn consumer(
        &self,
        queue: &str,
        routing_key: RoutingKey,
        handler: Arc<dyn MessageHandler>,
        policy: RetryPolicy,
    ) -> ConsumerWorker {
        ConsumerWorker::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.topology),
            QueueBinding::new(queue, routing_key),
            handler,
            policy,
            self.telemetry.clone(),
        )
    }

    /// Starts a consumer task on `queue` bound to `routing_key`.
    pub fn subscribe(
        &self,
        queue: &str,
        routing_key: RoutingKey,
        handler: Arc<dyn MessageHandler>,
        policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> JoinHandle<Result<(), BrokerError>> {
        let worker = self.consumer(queue, routing_key, handler, policy);
        tokio::spawn(async move {
            let queue = worker.queue().to_string();
            let result = worker.run(shutdown).await;
            if let Err(error) = &result {
                error!(queue = %queue, error = %error, "consumer terminated");
            }
            result
        })
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.transport.close().await?;
        info!("broker connection closed");
        Ok(())
    }
}

/// Waits for every consumer. The first one to stop outside shutdown cancels
/// the rest and its error is returned, so the role exits non-zero.
pub async fn join_consumers(
    consumers: Vec<JoinHandle<Result<(), BrokerError>>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut pending: FuturesUnordered<_> = consumers.into_iter().collect();
    let mut failure = None;
    while let Some(joined) = pending.next().await {
        let stopped = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => anyhow::Error::new(error).context("consumer stopped"),
            Err(error) => anyhow::Error::new(error).context("consumer task panicked"),
        };
        if failure.is_none() {
            error!(
                error = %format!("{stopped:#}"),
                remaining = pending.len(),
                "consumer lost; stopping the others"
            );
            shutdown.cancel();
            failure = Some(stopped);
        }
    }
    failure.map_or(Ok(()), Err)
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("topology", &self.topology)
            .finish_non_exhaustive()
    }
}
