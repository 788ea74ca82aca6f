use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::broker::{
    DeliveryContext, DraftRequest, MessageHandler, Payload, PipelineMessage, Producer,
    SummarizeRequest, TIMESTAMP_FIELD,
};
use crate::clients::{Summarizer, SummaryInput};
use crate::store::{DraftCreation, LedgerEntry, NewDraft, NewSummary, PipelineStore};
use crate::util::idempotency::summarize_key;

/// `summarize.request` → Summary + draft Publication → `publication.draft.request`.
pub struct SummarizeHandler {
    store: Arc<dyn PipelineStore>,
    summarizer: Arc<dyn Summarizer>,
    producer: Producer,
    channel_id: Option<String>,
    ledger_enabled: bool,
}

impl SummarizeHandler {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        summarizer: Arc<dyn Summarizer>,
        producer: Producer,
        channel_id: Option<String>,
        ledger_enabled: bool,
    ) -> Self {
        Self {
            store,
            summarizer,
            producer,
            channel_id,
            ledger_enabled,
        }
    }

    /// A committed earlier attempt may have died before publishing its draft
    /// request, so duplicates re-emit it. The draft stage dedupes on its own key.
    async fn reemit(&self, entry: &LedgerEntry) -> Result<()> {
        let (Some(summary_id), Some(publication_id)) = (entry.summary_id, entry.publication_id)
        else {
            warn!(key = %entry.key, "ledger entry has no records; skipping");
            return Ok(());
        };
        info!(key = %entry.key, %publication_id, "duplicate summarize request; re-emitting draft request");
        self.producer
            .send(&DraftRequest {
                summary_id,
                publication_id,
            })
            .await
            .context("failed to re-emit draft request")
    }
}

#[async_trait]
impl MessageHandler for SummarizeHandler {
    async fn handle(&self, payload: &Payload, context: &DeliveryContext) -> Result<()> {
        let request = match SummarizeRequest::from_payload(payload) {
            Ok(request) => request,
            Err(error) => {
                warn!(error = %error, "summarize request missing articleId");
                return Ok(());
            }
        };
        let article_id = request.article_id;

        let ledger_key = self.ledger_enabled.then(|| {
            summarize_key(article_id, payload.get(TIMESTAMP_FIELD).and_then(Value::as_str))
        });
        if let Some(key) = ledger_key.as_deref() {
            if let Some(entry) = self.store.find_ledger_entry(key).await? {
                return self.reemit(&entry).await;
            }
        }

        let Some(found) = self.store.find_article(article_id).await? else {
            error!(%article_id, "article not found for summarization");
            return Ok(());
        };
        let text = found
            .text
            .as_ref()
            .map(|text| text.best_text().trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            warn!(%article_id, "no text available for summarization");
            return Ok(());
        }

        let generated = self
            .summarizer
            .summarize(SummaryInput {
                title: found.article.title.clone(),
                text,
            })
            .await
            .with_context(|| format!("summarization failed for article {article_id}"))?;

        let creation = self
            .store
            .create_summary_with_draft(NewDraft {
                summary: NewSummary {
                    article_id,
                    text: generated.text,
                    needs_review: generated.needs_review,
                    created_by: generated.created_by,
                },
                channel_id: self.channel_id.clone(),
                ledger_key,
            })
            .await?;

        match creation {
            DraftCreation::Created {
                summary,
                publication,
            } => {
                self.producer
                    .send(&DraftRequest {
                        summary_id: summary.id,
                        publication_id: publication.id,
                    })
                    .await
                    .context("failed to publish draft request")?;
                info!(
                    %article_id,
                    summary_id = %summary.id,
                    publication_id = %publication.id,
                    needs_review = summary.needs_review,
                    attempt = context.attempt,
                    "summary generated and draft queued"
                );
                Ok(())
            }
            DraftCreation::Duplicate(entry) => self.reemit(&entry).await,
        }
    }
}
