use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::broker::{DeliveryContext, DraftRequest, MessageHandler, Payload, PipelineMessage};
use crate::clients::{DeliveryAdapter, PostContent, build_post};
use crate::store::PipelineStore;
use crate::util::idempotency::draft_key;

/// `publication.draft.request` → owner preview.
pub struct DraftHandler {
    store: Arc<dyn PipelineStore>,
    delivery: Arc<dyn DeliveryAdapter>,
    ledger_enabled: bool,
}

impl DraftHandler {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        delivery: Arc<dyn DeliveryAdapter>,
        ledger_enabled: bool,
    ) -> Self {
        Self {
            store,
            delivery,
            ledger_enabled,
        }
    }
}

#[async_trait]
impl MessageHandler for DraftHandler {
    async fn handle(&self, payload: &Payload, _context: &DeliveryContext) -> Result<()> {
        let request = match DraftRequest::from_payload(payload) {
            Ok(request) => request,
            Err(error) => {
                warn!(error = %error, "draft request missing identifiers");
                return Ok(());
            }
        };
        let publication_id = request.publication_id;

        let ledger_key = self.ledger_enabled.then(|| draft_key(publication_id));
        if let Some(key) = ledger_key.as_deref() {
            if self.store.find_ledger_entry(key).await?.is_some() {
                info!(%publication_id, "draft preview already sent");
                return Ok(());
            }
        }

        let Some(bundle) = self.store.find_publication(publication_id).await? else {
            error!(%publication_id, "publication not found for draft request");
            return Ok(());
        };

        let post = build_post(&PostContent::from_bundle(&bundle));
        debug!(%publication_id, summary_id = %request.summary_id, message = %post, "draft prepared");
        let preview_id = self
            .delivery
            .send_draft(&post)
            .await
            .context("failed to send draft preview")?;

        let recorded = self
            .store
            .record_draft_preview(publication_id, preview_id, ledger_key.as_deref())
            .await?;
        if recorded {
            info!(%publication_id, summary_id = %request.summary_id, "draft sent to owner");
        } else {
            warn!(%publication_id, "draft preview recorded concurrently");
        }
        Ok(())
    }
}
