use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::state::PublicationStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rss,
    Api,
    Html,
}

impl SourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rss => "rss",
            Self::Api => "api",
            Self::Html => "html",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "rss" => Ok(Self::Rss),
            "api" => Ok(Self::Api),
            "html" => Ok(Self::Html),
            other => Err(anyhow::anyhow!("unknown source kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub base_url: String,
    pub enabled: bool,
    pub schedule: Option<String>,
    pub rate_limit: Option<i32>,
    pub priority: i32,
    pub default_tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSource {
    pub name: String,
    pub kind: SourceKind,
    pub base_url: String,
    pub enabled: bool,
    pub schedule: Option<String>,
    pub rate_limit: Option<i32>,
    pub priority: i32,
    pub default_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: Uuid,
    pub source_id: Uuid,
    pub external_id: Option<String>,
    pub title: String,
    pub url: String,
    pub fulltext_url: Option<String>,
    pub journal: Option<String>,
    pub year: Option<i32>,
    pub license: Option<String>,
    pub language: Option<String>,
    pub authors: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Upsert input. With an `external_id` the (source, external id) pair is the
/// identity; without one a fresh article is always created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArticle {
    pub source_id: Uuid,
    pub external_id: Option<String>,
    pub title: String,
    pub url: String,
    pub fulltext_url: Option<String>,
    pub journal: Option<String>,
    pub year: Option<i32>,
    pub license: Option<String>,
    pub language: Option<String>,
    pub authors: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleText {
    pub article_id: Uuid,
    pub raw_text: String,
    pub cleaned_text: Option<String>,
    pub ocr_used: bool,
}

impl ArticleText {
    /// Cleaned text when present and non-empty, else the raw text.
    #[must_use]
    pub fn best_text(&self) -> &str {
        self.cleaned_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(&self.raw_text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArticleText {
    pub raw_text: String,
    pub cleaned_text: Option<String>,
    pub ocr_used: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleWithText {
    pub article: Article,
    pub text: Option<ArticleText>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub id: Uuid,
    pub article_id: Uuid,
    pub text: String,
    pub needs_review: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSummary {
    pub article_id: Uuid,
    pub text: String,
    pub needs_review: bool,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Publication {
    pub id: Uuid,
    pub summary_id: Uuid,
    pub status: PublicationStatus,
    pub channel_id: Option<String>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub dm_preview_message_id: Option<String>,
    pub delivery_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A publication with the summary and article it renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicationBundle {
    #[serde(flatten)]
    pub publication: Publication,
    pub summary: Summary,
    pub article: Article,
}

/// Summary plus its initial draft publication, created together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDraft {
    pub summary: NewSummary,
    pub channel_id: Option<String>,
    /// Dedupe key recorded in the same transaction.
    pub ledger_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftCreation {
    Created {
        summary: Summary,
        publication: Publication,
    },
    /// The ledger key already existed; nothing was written.
    Duplicate(LedgerEntry),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub key: String,
    pub summary_id: Option<Uuid>,
    pub publication_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
