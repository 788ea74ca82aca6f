use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use super::error::BrokerError;
use super::message::{Payload, PipelineMessage, encode_payload};
use super::topology::RoutingKey;
use super::transport::Transport;
use crate::observability::Telemetry;

/// Publishes onto the pipeline exchange through the process-wide transport.
#[derive(Clone)]
pub struct Producer {
    transport: Arc<dyn Transport>,
    exchange: String,
    telemetry: Option<Telemetry>,
}

impl Producer {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        exchange: impl Into<String>,
        telemetry: Option<Telemetry>,
    ) -> Self {
        Self {
            transport,
            exchange: exchange.into(),
            telemetry,
        }
    }

    /// Stamps `timestamp` and publishes a flat payload. Not retried.
    pub async fn publish(&self, routing_key: RoutingKey, payload: Payload) -> Result<(), BrokerError> {
        let body = encode_payload(payload, Utc::now())?;
        debug!(
            routing_key = %routing_key,
            payload = %String::from_utf8_lossy(&body),
            "publishing message"
        );

        let result = self
            .transport
            .publish(&self.exchange, routing_key.as_str(), &body, 1)
            .await;
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_published(routing_key.as_str(), result.is_ok());
        }
        if let Err(error) = &result {
            warn!(routing_key = %routing_key, error = %error, "publish failed");
        }
        result
    }

    pub async fn send<M: PipelineMessage>(&self, message: &M) -> Result<(), BrokerError> {
        self.publish(M::ROUTING_KEY, message.to_payload()?).await
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("exchange", &self.exchange)
            .finish_non_exhaustive()
    }
}
