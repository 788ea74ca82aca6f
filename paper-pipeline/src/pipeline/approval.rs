use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{Producer, PublicationApproved};
use crate::observability::Telemetry;
use crate::pipeline::state::{PublicationStatus, TransitionOutcome};
use crate::store::{PipelineStore, Publication};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("publication {0} not found")]
    NotFound(Uuid),
    #[error("publication is {current} and cannot be approved")]
    InvalidTransition { current: PublicationStatus },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Owner approval: `draft | approved | failed → approved`, then `publication.approved`.
#[derive(Clone)]
pub struct ApprovalService {
    store: Arc<dyn PipelineStore>,
    producer: Producer,
    telemetry: Option<Telemetry>,
}

impl ApprovalService {
    pub fn new(store: Arc<dyn PipelineStore>, producer: Producer, telemetry: Option<Telemetry>) -> Self {
        Self {
            store,
            producer,
            telemetry,
        }
    }

    pub async fn approve(
        &self,
        publication_id: Uuid,
        approved_by: &str,
    ) -> Result<Publication, ApprovalError> {
        let outcome = self
            .store
            .approve(publication_id, approved_by, Utc::now())
            .await?;
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_transition(PublicationStatus::Approved.as_str(), outcome.label());
        }

        let publication = match outcome {
            TransitionOutcome::Applied(publication) => publication,
            TransitionOutcome::Rejected { current } => {
                return Err(ApprovalError::InvalidTransition { current });
            }
            TransitionOutcome::NotFound => return Err(ApprovalError::NotFound(publication_id)),
        };

        // The approval is committed; dispatch reads the store, not this event.
        if let Err(error) = self
            .producer
            .send(&PublicationApproved {
                publication_id,
                summary_id: publication.summary_id,
            })
            .await
        {
            warn!(%publication_id, error = %error, "failed to publish approval event");
        }
        info!(%publication_id, approved_by, "publication approved");
        Ok(publication)
    }
}
