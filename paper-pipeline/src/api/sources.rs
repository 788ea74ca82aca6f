use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;

use super::error::ApiError;
use crate::app::AppState;
use crate::store::{NewSource, Source, SourceKind};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSourceRequest {
    name: String,
    #[serde(rename = "type")]
    kind: SourceKind,
    base_url: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    rate_limit: Option<i32>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    default_tags: Vec<String>,
}

fn enabled_by_default() -> bool {
    true
}

pub(crate) async fn list(State(state): State<AppState>) -> Result<Json<Vec<Source>>, ApiError> {
    let sources = state
        .store()
        .list_sources()
        .await
        .map_err(|error| ApiError::internal(&error))?;
    Ok(Json(sources))
}

pub(crate) async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateSourceRequest>,
) -> Result<(StatusCode, Json<Source>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    if request.base_url.trim().is_empty() {
        return Err(ApiError::bad_request("baseUrl must not be empty"));
    }

    let source = state
        .store()
        .create_source(NewSource {
            name: request.name.trim().to_string(),
            kind: request.kind,
            base_url: request.base_url.trim().to_string(),
            enabled: request.enabled,
            schedule: request.schedule.filter(|schedule| !schedule.trim().is_empty()),
            rate_limit: request.rate_limit,
            priority: request.priority,
            default_tags: request.default_tags,
        })
        .await
        .map_err(|error| ApiError::internal(&error))?;
    Ok((StatusCode::CREATED, Json(source)))
}
