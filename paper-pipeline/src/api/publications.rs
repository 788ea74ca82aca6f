use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use uuid::Uuid;

use super::error::ApiError;
use super::summaries::ListQuery;
use crate::app::AppState;
use crate::pipeline::ApprovalError;
use crate::store::{Publication, PublicationBundle};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApproveRequest {
    approved_by: String,
}

pub(crate) async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<PublicationBundle>>, ApiError> {
    let publications = state
        .store()
        .recent_publications(query.limit())
        .await
        .map_err(|error| ApiError::internal(&error))?;
    Ok(Json(publications))
}

pub(crate) async fn approve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ApproveRequest>,
) -> Result<(StatusCode, Json<Publication>), ApiError> {
    let approved_by = request.approved_by.trim();
    if approved_by.is_empty() {
        return Err(ApiError::bad_request("approvedBy must not be empty"));
    }

    match state.approval().approve(id, approved_by).await {
        Ok(publication) => Ok((StatusCode::ACCEPTED, Json(publication))),
        Err(ApprovalError::NotFound(_)) => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("publication {id} not found"),
        )),
        Err(error @ ApprovalError::InvalidTransition { .. }) => {
            Err(ApiError::new(StatusCode::CONFLICT, error.to_string()))
        }
        Err(ApprovalError::Store(error)) => Err(ApiError::internal(&error)),
    }
}
