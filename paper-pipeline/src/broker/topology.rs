use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Topic exchange every pipeline message is published to.
pub const PIPELINE_EXCHANGE: &str = "pipeline";
/// Exchange receiving messages that exhausted their retry budget.
pub const DEAD_LETTER_EXCHANGE: &str = "pipeline.dlx";
/// AMQP default exchange; routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Fixed routing-key vocabulary of the pipeline.
///
/// A key's message shape never changes for the lifetime of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutingKey {
    #[serde(rename = "crawl.start")]
    CrawlStart,
    #[serde(rename = "fetch.request")]
    FetchRequest,
    #[serde(rename = "parse.request")]
    ParseRequest,
    #[serde(rename = "dedup.request")]
    DedupRequest,
    #[serde(rename = "summarize.request")]
    SummarizeRequest,
    #[serde(rename = "publication.draft.request")]
    PublicationDraftRequest,
    #[serde(rename = "publication.approved")]
    PublicationApproved,
    #[serde(rename = "publication.schedule")]
    PublicationSchedule,
}

impl RoutingKey {
    pub const ALL: [RoutingKey; 8] = [
        RoutingKey::CrawlStart,
        RoutingKey::FetchRequest,
        RoutingKey::ParseRequest,
        RoutingKey::DedupRequest,
        RoutingKey::SummarizeRequest,
        RoutingKey::PublicationDraftRequest,
        RoutingKey::PublicationApproved,
        RoutingKey::PublicationSchedule,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingKey::CrawlStart => "crawl.start",
            RoutingKey::FetchRequest => "fetch.request",
            RoutingKey::ParseRequest => "parse.request",
            RoutingKey::DedupRequest => "dedup.request",
            RoutingKey::SummarizeRequest => "summarize.request",
            RoutingKey::PublicationDraftRequest => "publication.draft.request",
            RoutingKey::PublicationApproved => "publication.approved",
            RoutingKey::PublicationSchedule => "publication.schedule",
        }
    }

    /// Name of the single durable queue bound to this key.
    #[must_use]
    pub fn default_queue(self) -> &'static str {
        match self {
            RoutingKey::CrawlStart => "crawler",
            RoutingKey::FetchRequest => "fetcher",
            RoutingKey::ParseRequest => "parser",
            RoutingKey::DedupRequest => "deduplicator",
            RoutingKey::SummarizeRequest => "summarizer",
            RoutingKey::PublicationDraftRequest => "publisher-drafts",
            RoutingKey::PublicationApproved => "publisher-approved",
            RoutingKey::PublicationSchedule => "publisher-schedule",
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingKey {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RoutingKey::ALL
            .into_iter()
            .find(|key| key.as_str() == value)
            .ok_or_else(|| format!("unknown routing key: {value}"))
    }
}

/// A durable queue and the binding key it listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub binding_key: String,
}

impl QueueBinding {
    #[must_use]
    pub fn new(queue: impl Into<String>, routing_key: RoutingKey) -> Self {
        Self {
            queue: queue.into(),
            binding_key: routing_key.as_str().to_string(),
        }
    }

    /// Binds on an arbitrary topic pattern (`*` / `#` wildcards allowed).
    #[must_use]
    pub fn with_pattern(queue: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            binding_key: pattern.into(),
        }
    }

    #[must_use]
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dead", self.queue)
    }
}

/// Broker layout shared by producers and consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange: String,
    dead_letter_exchange: String,
    bindings: Vec<QueueBinding>,
}

impl Topology {
    /// One durable queue per routing key on the `pipeline` exchange.
    #[must_use]
    pub fn pipeline() -> Self {
        let bindings = RoutingKey::ALL
            .into_iter()
            .map(|key| QueueBinding::new(key.default_queue(), key))
            .collect();
        Self {
            exchange: PIPELINE_EXCHANGE.to_string(),
            dead_letter_exchange: DEAD_LETTER_EXCHANGE.to_string(),
            bindings,
        }
    }

    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    #[must_use]
    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    #[must_use]
    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    #[must_use]
    pub fn binding_for(&self, key: RoutingKey) -> Option<&QueueBinding> {
        self.bindings
            .iter()
            .find(|binding| binding.binding_key == key.as_str())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::pipeline()
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) if word == "*" || word == head => matches_words(rest, tail),
            _ => false,
        },
    }
}
