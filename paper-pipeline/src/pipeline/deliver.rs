use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::broker::{DeliveryContext, MessageHandler, Payload, PipelineMessage, PublicationSchedule};
use crate::clients::{DeliveryAdapter, PostContent, build_post};
use crate::observability::Telemetry;
use crate::pipeline::state::{PublicationStatus, TransitionOutcome};
use crate::store::PipelineStore;

/// `publication.schedule` → channel post → `sent`.
///
/// Only `scheduled` publications are delivered. A redelivery after the post
/// was marked `sent` is acked without posting again.
pub struct ScheduledPublicationHandler {
    store: Arc<dyn PipelineStore>,
    delivery: Arc<dyn DeliveryAdapter>,
    telemetry: Option<Telemetry>,
}

impl ScheduledPublicationHandler {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        delivery: Arc<dyn DeliveryAdapter>,
        telemetry: Option<Telemetry>,
    ) -> Self {
        Self {
            store,
            delivery,
            telemetry,
        }
    }

    fn record(&self, to: PublicationStatus, outcome: &TransitionOutcome) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_transition(to.as_str(), outcome.label());
        }
    }
}

#[async_trait]
impl MessageHandler for ScheduledPublicationHandler {
    async fn handle(&self, payload: &Payload, context: &DeliveryContext) -> Result<()> {
        let message = match PublicationSchedule::from_payload(payload) {
            Ok(message) => message,
            Err(error) => {
                warn!(error = %error, "publication schedule missing identifiers");
                return Ok(());
            }
        };
        let publication_id = message.publication_id;

        let Some(bundle) = self.store.find_publication(publication_id).await? else {
            error!(%publication_id, "publication not found for delivery");
            return Ok(());
        };
        match bundle.publication.status {
            PublicationStatus::Scheduled => {}
            PublicationStatus::Sent => {
                info!(%publication_id, "publication already sent");
                return Ok(());
            }
            other => {
                warn!(%publication_id, status = %other, "publication is not scheduled; refusing delivery");
                return Ok(());
            }
        }

        let post = build_post(&PostContent::from_bundle(&bundle));
        match self.delivery.send_to_channel(&post).await {
            Ok(message_id) => {
                let outcome = self
                    .store
                    .mark_sent(publication_id, message_id, Utc::now())
                    .await?;
                self.record(PublicationStatus::Sent, &outcome);
                match outcome {
                    TransitionOutcome::Applied(_) => {
                        info!(%publication_id, summary_id = %message.summary_id, "publication sent to channel");
                    }
                    TransitionOutcome::Rejected { current } => {
                        warn!(%publication_id, status = %current, "publication changed status during delivery");
                    }
                    TransitionOutcome::NotFound => {
                        error!(%publication_id, "publication vanished during delivery");
                    }
                }
                Ok(())
            }
            Err(send_error) => {
                if context.is_final_attempt() {
                    let outcome = self.store.mark_failed(publication_id).await?;
                    self.record(PublicationStatus::Failed, &outcome);
                    error!(
                        %publication_id,
                        attempt = context.attempt,
                        error = %send_error,
                        "delivery failed on final attempt; publication marked failed"
                    );
                } else {
                    self.store.record_delivery_failure(publication_id).await?;
                    warn!(
                        %publication_id,
                        attempt = context.attempt,
                        max_attempts = context.max_attempts,
                        error = %send_error,
                        "delivery failed; will retry"
                    );
                }
                Err(anyhow!("channel delivery failed for {publication_id}: {send_error:#}"))
            }
        }
    }
}
