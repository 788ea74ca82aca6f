mod error;
mod health;
mod metrics;
mod publications;
mod sources;
mod summaries;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::app::AppState;

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/ready", get(health::ready))
        .route("/health/live", get(health::live))
        .route("/metrics", get(metrics::exporter))
        .route("/v1/sources", get(sources::list).post(sources::create))
        .route("/v1/summaries", get(summaries::list).post(summaries::ingest))
        .route("/v1/publications", get(publications::list))
        .route("/v1/publications/{id}/approve", post(publications::approve))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
