use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use tracing::error;

use crate::app::AppState;

#[derive(Debug, Serialize)]
pub(crate) struct HealthReport {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

pub(crate) async fn ready(
    State(state): State<AppState>,
) -> Result<Json<HealthReport>, (StatusCode, Json<HealthReport>)> {
    if let Err(error) = state.store().ping().await {
        error!(%error, "store readiness check failed");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthReport {
                status: "degraded",
                detail: Some(format!("store: {error:#}")),
            }),
        ));
    }
    Ok(Json(HealthReport {
        status: "ready",
        detail: None,
    }))
}

pub(crate) async fn live() -> Json<HealthReport> {
    Json(HealthReport {
        status: "live",
        detail: None,
    })
}
