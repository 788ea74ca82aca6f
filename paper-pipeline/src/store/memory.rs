//! テスト・ドライラン用のインメモリストア。
//!
//! 全操作を一つの Mutex で直列化し、PostgreSQL 実装の条件付き更新と同じ結果を返す。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    Article, ArticleText, ArticleWithText, DraftCreation, LedgerEntry, NewArticle, NewArticleText,
    NewDraft, NewSource, Publication, PublicationBundle, Source, Summary,
};
use super::traits::{ArticleStore, PipelineStore, PublicationStore, SourceStore};
use crate::pipeline::state::{PublicationStatus, Transition, TransitionOutcome};

#[derive(Debug, Default)]
struct State {
    sources: Vec<Source>,
    articles: Vec<Article>,
    texts: HashMap<Uuid, ArticleText>,
    summaries: Vec<Summary>,
    publications: Vec<Publication>,
    ledger: HashMap<String, LedgerEntry>,
}

impl State {
    fn bundle(&self, publication: &Publication) -> Option<PublicationBundle> {
        let summary = self
            .summaries
            .iter()
            .find(|summary| summary.id == publication.summary_id)?;
        let article = self
            .articles
            .iter()
            .find(|article| article.id == summary.article_id)?;
        Some(PublicationBundle {
            publication: publication.clone(),
            summary: summary.clone(),
            article: article.clone(),
        })
    }

    /// Applies `update` when the current status is accepted by `transition`.
    fn transition(
        &mut self,
        publication_id: Uuid,
        transition: Transition,
        update: impl FnOnce(&mut Publication),
    ) -> TransitionOutcome {
        let Some(publication) = self
            .publications
            .iter_mut()
            .find(|publication| publication.id == publication_id)
        else {
            return TransitionOutcome::NotFound;
        };
        if !transition.accepts(publication.status) {
            return TransitionOutcome::Rejected {
                current: publication.status,
            };
        }
        publication.status = transition.target();
        update(publication);
        TransitionOutcome::Applied(publication.clone())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<Summary> {
        self.lock().summaries.clone()
    }

    #[must_use]
    pub fn publications(&self) -> Vec<Publication> {
        self.lock().publications.clone()
    }

    #[must_use]
    pub fn publication(&self, publication_id: Uuid) -> Option<Publication> {
        self.lock()
            .publications
            .iter()
            .find(|publication| publication.id == publication_id)
            .cloned()
    }

    /// Test hook: writes a publication row as-is, bypassing the state machine.
    pub fn put_publication(&self, publication: Publication) {
        let mut state = self.lock();
        state
            .publications
            .retain(|existing| existing.id != publication.id);
        state.publications.push(publication);
    }
}

#[async_trait]
impl SourceStore for InMemoryStore {
    async fn create_source(&self, source: NewSource) -> Result<Source> {
        let created = Source {
            id: Uuid::now_v7(),
            name: source.name,
            kind: source.kind,
            base_url: source.base_url,
            enabled: source.enabled,
            schedule: source.schedule,
            rate_limit: source.rate_limit,
            priority: source.priority,
            default_tags: source.default_tags,
            created_at: Utc::now(),
        };
        self.lock().sources.push(created.clone());
        Ok(created)
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        Ok(self.lock().sources.clone())
    }

    async fn find_source(&self, source_id: Uuid) -> Result<Option<Source>> {
        Ok(self
            .lock()
            .sources
            .iter()
            .find(|source| source.id == source_id)
            .cloned())
    }

    async fn enabled_sources(&self) -> Result<Vec<Source>> {
        let mut sources: Vec<Source> = self
            .lock()
            .sources
            .iter()
            .filter(|source| source.enabled)
            .cloned()
            .collect();
        sources.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(sources)
    }
}

#[async_trait]
impl ArticleStore for InMemoryStore {
    async fn upsert_article(&self, article: NewArticle) -> Result<Article> {
        let mut state = self.lock();
        if !state.sources.iter().any(|source| source.id == article.source_id) {
            bail!("source {} does not exist", article.source_id);
        }

        if let Some(external_id) = article.external_id.as_deref() {
            if let Some(existing) = state.articles.iter_mut().find(|existing| {
                existing.source_id == article.source_id
                    && existing.external_id.as_deref() == Some(external_id)
            }) {
                existing.title = article.title;
                existing.url = article.url;
                existing.fulltext_url = article.fulltext_url;
                existing.journal = article.journal;
                existing.year = article.year;
                existing.license = article.license;
                existing.language = article.language;
                existing.authors = article.authors;
                existing.published_at = article.published_at;
                return Ok(existing.clone());
            }
        }

        let created = Article {
            id: Uuid::now_v7(),
            source_id: article.source_id,
            external_id: article.external_id,
            title: article.title,
            url: article.url,
            fulltext_url: article.fulltext_url,
            journal: article.journal,
            year: article.year,
            license: article.license,
            language: article.language,
            authors: article.authors,
            published_at: article.published_at,
            created_at: Utc::now(),
        };
        state.articles.push(created.clone());
        Ok(created)
    }

    async fn upsert_article_text(
        &self,
        article_id: Uuid,
        text: NewArticleText,
    ) -> Result<ArticleText> {
        let mut state = self.lock();
        if !state.articles.iter().any(|article| article.id == article_id) {
            bail!("article {article_id} does not exist");
        }
        let stored = ArticleText {
            article_id,
            raw_text: text.raw_text,
            cleaned_text: text.cleaned_text,
            ocr_used: text.ocr_used,
        };
        state.texts.insert(article_id, stored.clone());
        Ok(stored)
    }

    async fn find_article(&self, article_id: Uuid) -> Result<Option<ArticleWithText>> {
        let state = self.lock();
        Ok(state
            .articles
            .iter()
            .find(|article| article.id == article_id)
            .map(|article| ArticleWithText {
                article: article.clone(),
                text: state.texts.get(&article_id).cloned(),
            }))
    }

    async fn recent_summaries(&self, limit: i64) -> Result<Vec<Summary>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .lock()
            .summaries
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PublicationStore for InMemoryStore {
    async fn create_summary_with_draft(&self, draft: NewDraft) -> Result<DraftCreation> {
        let mut state = self.lock();
        if let Some(key) = draft.ledger_key.as_deref() {
            if let Some(existing) = state.ledger.get(key) {
                return Ok(DraftCreation::Duplicate(existing.clone()));
            }
        }
        if !state
            .articles
            .iter()
            .any(|article| article.id == draft.summary.article_id)
        {
            bail!("article {} does not exist", draft.summary.article_id);
        }

        let now = Utc::now();
        let summary = Summary {
            id: Uuid::now_v7(),
            article_id: draft.summary.article_id,
            text: draft.summary.text,
            needs_review: draft.summary.needs_review,
            created_by: draft.summary.created_by,
            created_at: now,
        };
        let publication = Publication {
            id: Uuid::now_v7(),
            summary_id: summary.id,
            status: PublicationStatus::Draft,
            channel_id: draft.channel_id,
            approved_by: None,
            approved_at: None,
            scheduled_at: None,
            sent_at: None,
            retry_count: 0,
            dm_preview_message_id: None,
            delivery_message_id: None,
            created_at: now,
        };
        if let Some(key) = draft.ledger_key {
            state.ledger.insert(
                key.clone(),
                LedgerEntry {
                    key,
                    summary_id: Some(summary.id),
                    publication_id: Some(publication.id),
                    created_at: now,
                },
            );
        }
        state.summaries.push(summary.clone());
        state.publications.push(publication.clone());
        Ok(DraftCreation::Created {
            summary,
            publication,
        })
    }

    async fn find_ledger_entry(&self, key: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.lock().ledger.get(key).cloned())
    }

    async fn record_draft_preview(
        &self,
        publication_id: Uuid,
        preview_message_id: Option<String>,
        ledger_key: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.lock();
        if let Some(key) = ledger_key {
            if state.ledger.contains_key(key) {
                return Ok(false);
            }
        }
        let Some(publication) = state
            .publications
            .iter_mut()
            .find(|publication| publication.id == publication_id)
        else {
            bail!("publication {publication_id} does not exist");
        };
        publication.dm_preview_message_id = preview_message_id;
        if let Some(key) = ledger_key {
            state.ledger.insert(
                key.to_string(),
                LedgerEntry {
                    key: key.to_string(),
                    summary_id: None,
                    publication_id: Some(publication_id),
                    created_at: Utc::now(),
                },
            );
        }
        Ok(true)
    }

    async fn find_publication(&self, publication_id: Uuid) -> Result<Option<PublicationBundle>> {
        let state = self.lock();
        Ok(state
            .publications
            .iter()
            .find(|publication| publication.id == publication_id)
            .and_then(|publication| state.bundle(publication)))
    }

    async fn recent_publications(&self, limit: i64) -> Result<Vec<PublicationBundle>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let state = self.lock();
        Ok(state
            .publications
            .iter()
            .rev()
            .filter_map(|publication| state.bundle(publication))
            .take(limit)
            .collect())
    }

    async fn approve(
        &self,
        publication_id: Uuid,
        approved_by: &str,
        approved_at: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        Ok(self
            .lock()
            .transition(publication_id, Transition::Approve, |publication| {
                publication.approved_by = Some(approved_by.to_string());
                publication.approved_at = Some(approved_at);
            }))
    }

    async fn claim_approved_in_window(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Vec<Publication>> {
        let mut state = self.lock();
        let mut claimed = Vec::new();
        for publication in &mut state.publications {
            let in_window = publication
                .approved_at
                .is_some_and(|approved_at| approved_at >= since && approved_at < until);
            if in_window && Transition::Claim.accepts(publication.status) {
                publication.status = Transition::Claim.target();
                publication.scheduled_at = Some(scheduled_at);
                claimed.push(publication.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_schedule_claim(&self, publication_id: Uuid) -> Result<TransitionOutcome> {
        Ok(self
            .lock()
            .transition(publication_id, Transition::Release, |publication| {
                publication.scheduled_at = None;
            }))
    }

    async fn mark_sent(
        &self,
        publication_id: Uuid,
        delivery_message_id: Option<String>,
        sent_at: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        Ok(self
            .lock()
            .transition(publication_id, Transition::MarkSent, |publication| {
                publication.sent_at = Some(sent_at);
                publication.retry_count = 0;
                publication.delivery_message_id = delivery_message_id;
            }))
    }

    async fn mark_failed(&self, publication_id: Uuid) -> Result<TransitionOutcome> {
        Ok(self
            .lock()
            .transition(publication_id, Transition::MarkFailed, |publication| {
                publication.retry_count += 1;
            }))
    }

    async fn record_delivery_failure(&self, publication_id: Uuid) -> Result<TransitionOutcome> {
        let mut state = self.lock();
        let Some(publication) = state
            .publications
            .iter_mut()
            .find(|publication| publication.id == publication_id)
        else {
            return Ok(TransitionOutcome::NotFound);
        };
        if publication.status != PublicationStatus::Scheduled {
            return Ok(TransitionOutcome::Rejected {
                current: publication.status,
            });
        }
        publication.retry_count += 1;
        Ok(TransitionOutcome::Applied(publication.clone()))
    }
}

#[async_trait]
impl PipelineStore for InMemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::store::models::{NewSummary, SourceKind};

    async fn seeded() -> (InMemoryStore, Article) {
        let store = InMemoryStore::new();
        let source = store
            .create_source(NewSource {
                name: "Nature".into(),
                kind: SourceKind::Rss,
                base_url: "https://www.nature.com/nature.rss".into(),
                enabled: true,
                schedule: None,
                rate_limit: None,
                priority: 0,
                default_tags: vec![],
            })
            .await
            .expect("source");
        let article = store
            .upsert_article(new_article(source.id, Some("10.1038/x")))
            .await
            .expect("article");
        (store, article)
    }

    fn new_article(source_id: Uuid, external_id: Option<&str>) -> NewArticle {
        NewArticle {
            source_id,
            external_id: external_id.map(str::to_string),
            title: "Title".into(),
            url: "https://example.org/a".into(),
            fulltext_url: None,
            journal: None,
            year: Some(2025),
            license: None,
            language: None,
            authors: vec!["A. Author".into()],
            published_at: None,
        }
    }

    fn draft(article_id: Uuid, key: Option<&str>) -> NewDraft {
        NewDraft {
            summary: NewSummary {
                article_id,
                text: "summary".into(),
                needs_review: false,
                created_by: "openai".into(),
            },
            channel_id: None,
            ledger_key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn upsert_reuses_article_for_same_external_id() {
        let (store, article) = seeded().await;

        let mut update = new_article(article.source_id, Some("10.1038/x"));
        update.title = "Updated".into();
        let again = store.upsert_article(update).await.expect("upsert");
        let fresh = store
            .upsert_article(new_article(article.source_id, None))
            .await
            .expect("fresh");

        assert_eq!(again.id, article.id);
        assert_eq!(again.title, "Updated");
        assert_ne!(fresh.id, article.id);
    }

    #[tokio::test]
    async fn ledger_key_blocks_second_draft() {
        let (store, article) = seeded().await;

        let first = store
            .create_summary_with_draft(draft(article.id, Some("summarize:a")))
            .await
            .expect("first");
        let second = store
            .create_summary_with_draft(draft(article.id, Some("summarize:a")))
            .await
            .expect("second");

        assert!(matches!(first, DraftCreation::Created { .. }));
        assert!(matches!(second, DraftCreation::Duplicate(_)));
        assert_eq!(store.summaries().len(), 1);
    }

    #[tokio::test]
    async fn claim_respects_half_open_window() {
        let (store, article) = seeded().await;
        let now = Utc::now();
        let DraftCreation::Created { publication, .. } = store
            .create_summary_with_draft(draft(article.id, None))
            .await
            .expect("draft")
        else {
            panic!("expected created draft");
        };
        store
            .approve(publication.id, "owner", now)
            .await
            .expect("approve");

        let claimed = store
            .claim_approved_in_window(now - Duration::hours(24), now, now)
            .await
            .expect("claim");
        assert!(claimed.is_empty(), "upper bound is exclusive");

        let claimed = store
            .claim_approved_in_window(now, now + Duration::seconds(1), now)
            .await
            .expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, PublicationStatus::Scheduled);
    }

    #[tokio::test]
    async fn mark_failed_increments_retry_count() {
        let (store, article) = seeded().await;
        let now = Utc::now();
        let DraftCreation::Created { publication, .. } = store
            .create_summary_with_draft(draft(article.id, None))
            .await
            .expect("draft")
        else {
            panic!("expected created draft");
        };
        store.approve(publication.id, "owner", now).await.expect("approve");
        store
            .claim_approved_in_window(now, now + Duration::seconds(1), now)
            .await
            .expect("claim");

        let outcome = store.mark_failed(publication.id).await.expect("fail");

        let TransitionOutcome::Applied(failed) = outcome else {
            panic!("expected applied transition");
        };
        assert_eq!(failed.status, PublicationStatus::Failed);
        assert_eq!(failed.retry_count, 1);
    }
}
