mod common;

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use paper_pipeline::app::{ComponentRegistry, build_router};
use paper_pipeline::broker::{Broker, MemoryTransport, RoutingKey};
use paper_pipeline::observability::Telemetry;
use paper_pipeline::pipeline::PublicationStatus;
use paper_pipeline::store::{DraftCreation, InMemoryStore, NewDraft, NewSummary, PublicationStore};

use common::seed_article;

async fn app() -> (Router, Arc<InMemoryStore>, MemoryTransport) {
    let store = Arc::new(InMemoryStore::new());
    let telemetry = Telemetry::new().expect("telemetry");
    let (broker, transport) = Broker::in_memory().await.expect("broker");
    let registry = ComponentRegistry::from_parts(
        store.clone(),
        broker.with_telemetry(telemetry.clone()),
        telemetry,
    );
    (build_router(registry), store, transport)
}

fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

async fn draft(store: &InMemoryStore) -> Uuid {
    let (_, article) = seed_article(store).await;
    let creation = store
        .create_summary_with_draft(NewDraft {
            summary: NewSummary {
                article_id: article.id,
                text: "summary".to_string(),
                needs_review: false,
                created_by: "stub".to_string(),
            },
            channel_id: None,
            ledger_key: None,
        })
        .await
        .expect("draft");
    match creation {
        DraftCreation::Created { publication, .. } => publication.id,
        DraftCreation::Duplicate(_) => panic!("expected a new draft"),
    }
}

#[tokio::test]
async fn health_endpoints_respond() {
    let (app, _, _) = app().await;

    let live = app.clone().oneshot(get("/health/live")).await.expect("live");
    assert_eq!(live.status(), StatusCode::OK);
    assert_eq!(body_json(live).await["status"], json!("live"));

    let ready = app.oneshot(get("/health/ready")).await.expect("ready");
    assert_eq!(ready.status(), StatusCode::OK);
    assert_eq!(body_json(ready).await["status"], json!("ready"));
}

#[tokio::test]
async fn sources_can_be_created_and_listed() {
    let (app, _, _) = app().await;

    let created = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/sources",
            &json!({"name": "arXiv cs.AI", "type": "rss", "baseUrl": "https://arxiv.org/rss/cs.AI", "priority": 3}),
        ))
        .await
        .expect("create");
    assert_eq!(created.status(), StatusCode::CREATED);
    let created = body_json(created).await;
    assert_eq!(created["type"], json!("rss"));
    assert_eq!(created["enabled"], json!(true));

    let listed = app.oneshot(get("/v1/sources")).await.expect("list");
    assert_eq!(listed.status(), StatusCode::OK);
    let listed = body_json(listed).await;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
    assert_eq!(listed[0]["id"], created["id"]);
}

#[tokio::test]
async fn blank_source_name_is_rejected() {
    let (app, _, _) = app().await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/sources",
            &json!({"name": "  ", "type": "api", "baseUrl": "https://api.crossref.org"}),
        ))
        .await
        .expect("create");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ingest_queues_summarization() {
    let (app, store, transport) = app().await;
    let (source, _) = seed_article(&store).await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/summaries",
            &json!({
                "sourceId": source.id,
                "title": "A new catalyst for ammonia synthesis",
                "url": "https://doi.org/10.1126/science.0001",
                "abstract": "We report a catalyst operating at ambient pressure.",
                "authors": ["D. Author"]
            }),
        ))
        .await
        .expect("ingest");

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["status"], json!("queued"));
    let requests = transport.published_payloads(RoutingKey::SummarizeRequest);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["articleId"], body["articleId"]);
}

#[tokio::test]
async fn ingest_with_unknown_source_is_unprocessable() {
    let (app, _, transport) = app().await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/summaries",
            &json!({"sourceId": Uuid::now_v7(), "title": "t", "url": "https://example.org"}),
        ))
        .await
        .expect("ingest");

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn approve_moves_draft_to_approved_and_emits_event() {
    let (app, store, transport) = app().await;
    let publication_id = draft(&store).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/v1/publications/{publication_id}/approve"),
            &json!({"approvedBy": "owner"}),
        ))
        .await
        .expect("approve");

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["status"], json!("approved"));
    assert_eq!(body["approvedBy"], json!("owner"));
    assert_eq!(
        store.publication(publication_id).expect("publication").status,
        PublicationStatus::Approved
    );
    let events = transport.published_payloads(RoutingKey::PublicationApproved);
    assert_eq!(events[0]["publicationId"], json!(publication_id.to_string()));

    let listed = app.oneshot(get("/v1/publications")).await.expect("list");
    let listed = body_json(listed).await;
    assert_eq!(listed[0]["id"], json!(publication_id.to_string()));
    assert_eq!(listed[0]["summary"]["text"], json!("summary"));
}

#[tokio::test]
async fn approve_reports_missing_and_conflicting_publications() {
    let (app, store, _) = app().await;
    let publication_id = draft(&store).await;
    let mut publication = store.publication(publication_id).expect("publication");
    publication.status = PublicationStatus::Sent;
    store.put_publication(publication);

    let missing = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/v1/publications/{}/approve", Uuid::now_v7()),
            &json!({"approvedBy": "owner"}),
        ))
        .await
        .expect("approve");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let conflict = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/v1/publications/{publication_id}/approve"),
            &json!({"approvedBy": "owner"}),
        ))
        .await
        .expect("approve");
    assert_eq!(conflict.status(), StatusCode::CONFLICT);

    let blank = app
        .oneshot(json_request(
            "POST",
            &format!("/v1/publications/{publication_id}/approve"),
            &json!({"approvedBy": ""}),
        ))
        .await
        .expect("approve");
    assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn metrics_expose_published_messages() {
    let (app, store, _) = app().await;
    let publication_id = draft(&store).await;
    app.clone()
        .oneshot(json_request(
            "POST",
            &format!("/v1/publications/{publication_id}/approve"),
            &json!({"approvedBy": "owner"}),
        ))
        .await
        .expect("approve");

    let response = app.oneshot(get("/metrics")).await.expect("metrics");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let text = String::from_utf8(bytes.to_vec()).expect("utf8");
    assert!(text.contains("publication.approved"));
}
