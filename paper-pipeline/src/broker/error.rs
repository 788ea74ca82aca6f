use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] lapin::Error),
    #[error("broker channel operation `{operation}` failed: {source}")]
    Channel {
        operation: &'static str,
        #[source]
        source: lapin::Error,
    },
    #[error("payload field `{0}` must be a primitive or an array")]
    NestedPayload(String),
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("queue `{0}` is not declared")]
    UnknownQueue(String),
    #[error("broker transport is closed")]
    Closed,
    #[error("subscription on `{0}` ended before shutdown")]
    SubscriptionEnded(String),
    #[error("publish rejected by transport: {0}")]
    Rejected(String),
}

impl BrokerError {
    pub(crate) fn channel(operation: &'static str) -> impl FnOnce(lapin::Error) -> Self {
        move |source| Self::Channel { operation, source }
    }
}
