use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use tracing::{debug, info};
use uuid::Uuid;

use super::error::BrokerError;
use super::topology::{DEFAULT_EXCHANGE, QueueBinding, Topology};
use super::transport::{
    ATTEMPT_HEADER, Acknowledger, Delivery, ORIGIN_KEY_HEADER, Subscription, Transport,
};

const PERSISTENT: u8 = 2;
const PREFETCH: u16 = 1;

/// RabbitMQ transport owning one long-lived connection and publish channel.
pub struct AmqpTransport {
    connection: Connection,
    publish_channel: Channel,
}

impl AmqpTransport {
    /// Opens the process-wide connection. Called once at start-up.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let properties =
            ConnectionProperties::default().with_connection_name("paper-pipeline".into());
        let connection = Connection::connect(url, properties)
            .await
            .map_err(BrokerError::Connect)?;
        let publish_channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::channel("create_channel"))?;
        info!("connected to broker");
        Ok(Self {
            connection,
            publish_channel,
        })
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: FieldTable,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into())
            .with_headers(headers);

        // The returned confirm is dropped: hand-off to the channel is the guarantee.
        let _confirm = self
            .publish_channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(BrokerError::channel("basic_publish"))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        declare_exchanges(&self.publish_channel, topology).await?;
        for binding in topology.bindings() {
            declare_binding(&self.publish_channel, topology, binding).await?;
        }
        debug!(
            exchange = topology.exchange(),
            queues = topology.bindings().len(),
            "broker topology declared"
        );
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        attempt: u32,
    ) -> Result<(), BrokerError> {
        self.send(exchange, routing_key, body, delivery_headers(attempt, None))
            .await
    }

    async fn republish(
        &self,
        queue: &str,
        origin_routing_key: &str,
        body: &[u8],
        attempt: u32,
    ) -> Result<(), BrokerError> {
        let headers = delivery_headers(attempt, Some(origin_routing_key));
        self.send(DEFAULT_EXCHANGE, queue, body, headers).await
    }

    async fn subscribe(
        &self,
        topology: &Topology,
        binding: &QueueBinding,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(BrokerError::channel("create_channel"))?;
        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .map_err(BrokerError::channel("basic_qos"))?;
        declare_exchanges(&channel, topology).await?;
        declare_binding(&channel, topology, binding).await?;

        let consumer_tag = format!("{}-{}", binding.queue, Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &binding.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::channel("basic_consume"))?;

        Ok(Box::new(AmqpSubscription {
            consumer,
            _channel: channel,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(BrokerError::channel("connection_close"))
    }
}

struct AmqpSubscription {
    consumer: Consumer,
    _channel: Channel,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| {
                let attempt = attempt_from_headers(&delivery.properties);
                let routing_key = origin_from_headers(&delivery.properties)
                    .unwrap_or_else(|| delivery.routing_key.as_str().to_string());
                Delivery::new(
                    delivery.data,
                    routing_key,
                    delivery.redelivered,
                    attempt,
                    Box::new(AmqpAcker(delivery.acker)),
                )
            })
            .map_err(BrokerError::channel("consume")),
        )
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(BrokerError::channel("basic_ack"))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(BrokerError::channel("basic_nack"))
    }
}

async fn declare_exchanges(channel: &Channel, topology: &Topology) -> Result<(), BrokerError> {
    for exchange in [topology.exchange(), topology.dead_letter_exchange()] {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::channel("exchange_declare"))?;
    }
    Ok(())
}

/// Declares the work queue (dead-lettering into `<queue>.dead`) and its binding.
async fn declare_binding(
    channel: &Channel,
    topology: &Topology,
    binding: &QueueBinding,
) -> Result<(), BrokerError> {
    let durable = QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    };

    channel
        .queue_declare(&binding.queue, durable, queue_arguments(topology, binding))
        .await
        .map_err(BrokerError::channel("queue_declare"))?;
    channel
        .queue_bind(
            &binding.queue,
            topology.exchange(),
            &binding.binding_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(BrokerError::channel("queue_bind"))?;

    let dead_letter_queue = binding.dead_letter_queue();
    channel
        .queue_declare(&dead_letter_queue, durable, FieldTable::default())
        .await
        .map_err(BrokerError::channel("queue_declare"))?;
    channel
        .queue_bind(
            &dead_letter_queue,
            topology.dead_letter_exchange(),
            &binding.queue,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(BrokerError::channel("queue_bind"))?;
    Ok(())
}

fn queue_arguments(topology: &Topology, binding: &QueueBinding) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(topology.dead_letter_exchange().into()),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(binding.queue.as_str().into()),
    );
    arguments
}

fn delivery_headers(attempt: u32, origin_routing_key: Option<&str>) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(ATTEMPT_HEADER.into(), AMQPValue::LongUInt(attempt));
    if let Some(origin) = origin_routing_key {
        headers.insert(ORIGIN_KEY_HEADER.into(), AMQPValue::LongString(origin.into()));
    }
    headers
}

fn header<'a>(properties: &'a BasicProperties, name: &str) -> Option<&'a AMQPValue> {
    properties.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == name)
            .map(|(_, value)| value)
    })
}

fn attempt_from_headers(properties: &BasicProperties) -> u32 {
    header(properties, ATTEMPT_HEADER)
        .and_then(header_to_u32)
        .unwrap_or(1)
}

fn origin_from_headers(properties: &BasicProperties) -> Option<String> {
    match header(properties, ORIGIN_KEY_HEADER)? {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        AMQPValue::ShortString(value) => Some(value.as_str().to_string()),
        _ => None,
    }
}

// RabbitMQ may widen integer header types on re-publish.
fn header_to_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_defaults_to_first_delivery() {
        assert_eq!(attempt_from_headers(&BasicProperties::default()), 1);
    }

    #[test]
    fn attempt_reads_widened_integer_headers() {
        let mut headers = FieldTable::default();
        headers.insert(ATTEMPT_HEADER.into(), AMQPValue::LongLongInt(4));
        let properties = BasicProperties::default().with_headers(headers);

        assert_eq!(attempt_from_headers(&properties), 4);
    }

    #[test]
    fn retry_headers_carry_origin_routing_key() {
        let properties =
            BasicProperties::default().with_headers(delivery_headers(2, Some("summarize.request")));

        assert_eq!(attempt_from_headers(&properties), 2);
        assert_eq!(
            origin_from_headers(&properties).as_deref(),
            Some("summarize.request")
        );
    }

    #[test]
    fn first_publish_has_no_origin_header() {
        let properties = BasicProperties::default().with_headers(delivery_headers(1, None));

        assert_eq!(origin_from_headers(&properties), None);
    }

    #[test]
    fn queue_arguments_route_to_dead_letter_exchange() {
        let topology = Topology::pipeline();
        let binding = &topology.bindings()[0];
        let arguments = queue_arguments(&topology, binding);

        let keys: Vec<&str> = arguments.inner().keys().map(|key| key.as_str()).collect();
        assert!(keys.contains(&"x-dead-letter-exchange"));
        assert!(keys.contains(&"x-dead-letter-routing-key"));
    }
}
