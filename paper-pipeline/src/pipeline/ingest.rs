use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::broker::{BrokerError, Producer, SummarizeRequest};
use crate::store::{Article, NewArticle, NewArticleText, PipelineStore};

/// One article handed to the pipeline by a fetch adapter or an operator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestArticle {
    pub source_id: Uuid,
    #[serde(default)]
    pub external_id: Option<String>,
    pub title: String,
    pub url: String,
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub raw_text: Option<String>,
    #[serde(default)]
    pub cleaned_text: Option<String>,
    #[serde(default)]
    pub fulltext_url: Option<String>,
    #[serde(default)]
    pub journal: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ocr_used: bool,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source {0} not found")]
    UnknownSource(Uuid),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
    #[error("failed to enqueue summarization: {0}")]
    Publish(#[from] BrokerError),
}

/// Stores an article with its text and queues it for summarization.
#[derive(Clone)]
pub struct IngestService {
    store: Arc<dyn PipelineStore>,
    producer: Producer,
}

impl IngestService {
    pub fn new(store: Arc<dyn PipelineStore>, producer: Producer) -> Self {
        Self { store, producer }
    }

    pub async fn ingest(&self, input: IngestArticle) -> Result<Article, IngestError> {
        if self.store.find_source(input.source_id).await?.is_none() {
            return Err(IngestError::UnknownSource(input.source_id));
        }

        let raw_text = input
            .raw_text
            .or_else(|| input.abstract_text.clone())
            .unwrap_or_default();
        let cleaned_text = input.cleaned_text.or(input.abstract_text);

        let article = self
            .store
            .upsert_article(NewArticle {
                source_id: input.source_id,
                external_id: input.external_id,
                title: input.title,
                url: input.url,
                fulltext_url: input.fulltext_url,
                journal: input.journal,
                year: input.year,
                license: input.license,
                language: input.language,
                authors: input.authors,
                published_at: input.published_at,
            })
            .await?;
        self.store
            .upsert_article_text(
                article.id,
                NewArticleText {
                    raw_text,
                    cleaned_text,
                    ocr_used: input.ocr_used,
                },
            )
            .await?;

        self.producer
            .send(&SummarizeRequest {
                article_id: article.id,
                source_id: Some(article.source_id),
            })
            .await?;
        info!(article_id = %article.id, source_id = %article.source_id, "article queued for summarization");
        Ok(article)
    }
}
