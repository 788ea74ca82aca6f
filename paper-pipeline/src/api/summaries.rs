use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::error::ApiError;
use crate::app::AppState;
use crate::pipeline::{IngestArticle, IngestError};
use crate::store::Summary;

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    limit: Option<i64>,
}

impl ListQuery {
    pub(crate) fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Queued {
    article_id: Uuid,
    status: &'static str,
}

pub(crate) async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestArticle>,
) -> Result<(StatusCode, Json<Queued>), ApiError> {
    if request.title.trim().is_empty() || request.url.trim().is_empty() {
        return Err(ApiError::bad_request("title and url must not be empty"));
    }

    match state.ingest().ingest(request).await {
        Ok(article) => Ok((
            StatusCode::ACCEPTED,
            Json(Queued {
                article_id: article.id,
                status: "queued",
            }),
        )),
        Err(IngestError::UnknownSource(source_id)) => Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("source {source_id} not found"),
        )),
        Err(IngestError::Publish(error)) => {
            warn!(error = %error, "article stored but summarization was not queued");
            Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "article stored but could not be queued",
            ))
        }
        Err(IngestError::Store(error)) => Err(ApiError::internal(&error)),
    }
}

pub(crate) async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Summary>>, ApiError> {
    let summaries = state
        .store()
        .recent_summaries(query.limit())
        .await
        .map_err(|error| ApiError::internal(&error))?;
    Ok(Json(summaries))
}
