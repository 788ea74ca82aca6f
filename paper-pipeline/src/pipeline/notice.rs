use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::broker::{DeliveryContext, MessageHandler, Payload, PipelineMessage, PublicationApproved};

/// Drains `publisher-approved`. Approval is already committed in the store and
/// the publication dispatch claims from there, so the event is only logged.
pub struct ApprovalNoticeHandler;

#[async_trait]
impl MessageHandler for ApprovalNoticeHandler {
    async fn handle(&self, payload: &Payload, context: &DeliveryContext) -> Result<()> {
        match PublicationApproved::from_payload(payload) {
            Ok(notice) => info!(
                publication_id = %notice.publication_id,
                summary_id = %notice.summary_id,
                approved_at = ?context.timestamp,
                "publication approved; awaiting publication dispatch"
            ),
            Err(error) => warn!(error = %error, "approval notice missing identifiers"),
        }
        Ok(())
    }
}
