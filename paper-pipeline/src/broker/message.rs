use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use super::error::BrokerError;
use super::topology::RoutingKey;

/// Flat mapping of field name to primitive or array value.
pub type Payload = serde_json::Map<String, Value>;

/// Field the producer stamps on every message.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// A message bound to one routing key.
pub trait PipelineMessage: Serialize + DeserializeOwned + Send + Sync {
    const ROUTING_KEY: RoutingKey;

    /// Converts the message into a broker payload.
    fn to_payload(&self) -> Result<Payload, BrokerError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(BrokerError::Rejected(format!(
                "{} serialized to a non-object value: {other}",
                Self::ROUTING_KEY
            ))),
        }
    }

    /// Decodes a consumed payload; fails when a required field is missing or malformed.
    fn from_payload(payload: &Payload) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(payload.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlStart {
    pub source_id: Uuid,
    pub schedule: String,
}

impl PipelineMessage for CrawlStart {
    const ROUTING_KEY: RoutingKey = RoutingKey::CrawlStart;
}

/// `sourceId` is a hint; only `articleId` is needed to summarize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeRequest {
    pub article_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Uuid>,
}

impl PipelineMessage for SummarizeRequest {
    const ROUTING_KEY: RoutingKey = RoutingKey::SummarizeRequest;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftRequest {
    pub summary_id: Uuid,
    pub publication_id: Uuid,
}

impl PipelineMessage for DraftRequest {
    const ROUTING_KEY: RoutingKey = RoutingKey::PublicationDraftRequest;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicationApproved {
    pub publication_id: Uuid,
    pub summary_id: Uuid,
}

impl PipelineMessage for PublicationApproved {
    const ROUTING_KEY: RoutingKey = RoutingKey::PublicationApproved;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicationSchedule {
    pub publication_id: Uuid,
    pub summary_id: Uuid,
}

impl PipelineMessage for PublicationSchedule {
    const ROUTING_KEY: RoutingKey = RoutingKey::PublicationSchedule;
}

/// Rejects nested objects, including objects inside arrays.
pub fn validate_flat(payload: &Payload) -> Result<(), BrokerError> {
    for (field, value) in payload {
        let nested = match value {
            Value::Object(_) => true,
            Value::Array(items) => items.iter().any(Value::is_object),
            _ => false,
        };
        if nested {
            return Err(BrokerError::NestedPayload(field.clone()));
        }
    }
    Ok(())
}

/// Stamps `timestamp` (overwriting any caller value) and serializes the payload.
pub fn encode_payload(mut payload: Payload, generated_at: DateTime<Utc>) -> Result<Vec<u8>, BrokerError> {
    validate_flat(&payload)?;
    payload.insert(
        TIMESTAMP_FIELD.to_string(),
        Value::String(generated_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Ok(serde_json::to_vec(&payload)?)
}

/// Parses a delivery body; anything but a JSON object is an error.
pub fn decode_payload(body: &[u8]) -> Result<Payload, serde_json::Error> {
    serde_json::from_slice::<Payload>(body)
}

/// Reads the producer timestamp, if present and parseable.
#[must_use]
pub fn payload_timestamp(payload: &Payload) -> Option<DateTime<Utc>> {
    payload
        .get(TIMESTAMP_FIELD)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}
