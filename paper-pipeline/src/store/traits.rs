//! Data access seams for the pipeline roles.
//!
//! Each trait covers one aggregate. [`PipelineStore`] bundles them so roles can
//! share one `Arc<dyn PipelineStore>`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    Article, ArticleText, ArticleWithText, DraftCreation, LedgerEntry, NewArticle, NewArticleText,
    NewDraft, NewSource, Publication, PublicationBundle, Source, Summary,
};
use crate::pipeline::state::TransitionOutcome;

#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn create_source(&self, source: NewSource) -> Result<Source>;

    async fn list_sources(&self) -> Result<Vec<Source>>;

    async fn find_source(&self, source_id: Uuid) -> Result<Option<Source>>;

    /// 有効なソースを優先度の降順で返す。
    async fn enabled_sources(&self) -> Result<Vec<Source>>;
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn upsert_article(&self, article: NewArticle) -> Result<Article>;

    /// Replaces the single text row of `article_id`.
    async fn upsert_article_text(
        &self,
        article_id: Uuid,
        text: NewArticleText,
    ) -> Result<ArticleText>;

    async fn find_article(&self, article_id: Uuid) -> Result<Option<ArticleWithText>>;

    async fn recent_summaries(&self, limit: i64) -> Result<Vec<Summary>>;
}

#[async_trait]
pub trait PublicationStore: Send + Sync {
    /// Creates a summary and its `draft` publication in one transaction.
    ///
    /// When `draft.ledger_key` is set and already recorded, nothing is written
    /// and the existing entry is returned.
    async fn create_summary_with_draft(&self, draft: NewDraft) -> Result<DraftCreation>;

    async fn find_ledger_entry(&self, key: &str) -> Result<Option<LedgerEntry>>;

    /// Stores the owner preview id and, when given, records `ledger_key`.
    ///
    /// Returns `false` when the ledger key was already present.
    async fn record_draft_preview(
        &self,
        publication_id: Uuid,
        preview_message_id: Option<String>,
        ledger_key: Option<&str>,
    ) -> Result<bool>;

    async fn find_publication(&self, publication_id: Uuid) -> Result<Option<PublicationBundle>>;

    /// Newest first.
    async fn recent_publications(&self, limit: i64) -> Result<Vec<PublicationBundle>>;

    async fn approve(
        &self,
        publication_id: Uuid,
        approved_by: &str,
        approved_at: DateTime<Utc>,
    ) -> Result<TransitionOutcome>;

    /// Atomically moves every `approved` publication with
    /// `since <= approved_at < until` to `scheduled` and returns the claimed rows.
    async fn claim_approved_in_window(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Vec<Publication>>;

    /// `scheduled → approved`, keeping `approved_at`.
    async fn release_schedule_claim(&self, publication_id: Uuid) -> Result<TransitionOutcome>;

    async fn mark_sent(
        &self,
        publication_id: Uuid,
        delivery_message_id: Option<String>,
        sent_at: DateTime<Utc>,
    ) -> Result<TransitionOutcome>;

    /// `scheduled → failed`, incrementing `retry_count`.
    async fn mark_failed(&self, publication_id: Uuid) -> Result<TransitionOutcome>;

    /// Increments `retry_count` of a still-`scheduled` publication.
    async fn record_delivery_failure(&self, publication_id: Uuid) -> Result<TransitionOutcome>;
}

#[async_trait]
pub trait PipelineStore: SourceStore + ArticleStore + PublicationStore {
    async fn ping(&self) -> Result<()>;
}
