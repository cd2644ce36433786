//! Health endpoint tests against in-memory storage.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use courier::server::{create_router, AppState};
use courier_delivery::{
    storage::{mock::MockDeliveryStorage, DeliveryStorage},
    EngineStats,
};
use courier_testing::{fixtures::new_queue_item, Clock, DestinationBuilder, TestClock};
use http_body_util::BodyExt;
use tokio::sync::RwLock;
use tower::ServiceExt;

struct TestApp {
    storage: MockDeliveryStorage,
    clock: TestClock,
    stats: Arc<RwLock<EngineStats>>,
    app: Router,
}

impl TestApp {
    fn new() -> Self {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let state = AppState::new(Arc::new(storage.clone()), stats.clone(), Arc::new(clock.clone()));
        let app = create_router(state, Duration::from_secs(5));
        Self { storage, clock, stats, app }
    }

    async fn get(&self, uri: &str) -> Result<(StatusCode, serde_json::Value)> {
        let response = self
            .app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty())?)
            .await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok((status, serde_json::from_slice(&bytes)?))
    }
}

#[tokio::test]
async fn liveness_always_answers() -> Result<()> {
    let app = TestApp::new();
    app.storage.set_unavailable(true).await;

    let (status, body) = app.get("/health/live").await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
    assert_eq!(body["service"], "courier");
    Ok(())
}

#[tokio::test]
async fn readiness_reflects_store_availability() -> Result<()> {
    let app = TestApp::new();

    let (status, body) = app.get("/health/ready").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"]["status"], "up");
    assert!(body["database"].get("message").is_none());

    app.storage.set_unavailable(true).await;
    let (status, body) = app.get("/health/ready").await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["database"]["status"], "down");
    assert!(body["database"]["message"].as_str().is_some_and(|m| m.contains("connection refused")));
    Ok(())
}

#[tokio::test]
async fn queue_health_reports_backlog_and_engine_counters() -> Result<()> {
    let app = TestApp::new();
    let destination = DestinationBuilder::new().build();
    app.storage.add_destination(destination.clone()).await;

    let first = app.storage.enqueue(new_queue_item(&destination), app.clock.now_utc()).await?;
    app.clock.advance(Duration::from_secs(30));
    app.storage.enqueue(new_queue_item(&destination), app.clock.now_utc()).await?;
    app.storage.enqueue(new_queue_item(&destination), app.clock.now_utc()).await?;
    app.storage.claim(first.id, app.clock.now_utc()).await?;
    app.clock.advance(Duration::from_secs(60));

    {
        let mut stats = app.stats.write().await;
        stats.active_workers = 4;
        stats.successful_deliveries = 17;
        stats.retries_scheduled = 3;
    }

    let (status, body) = app.get("/health/queue").await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"], 2);
    assert_eq!(body["processing"], 1);
    assert_eq!(body["oldest_pending_age_seconds"], 60);
    assert_eq!(body["engine"]["active_workers"], 4);
    assert_eq!(body["engine"]["successful_deliveries"], 17);
    assert_eq!(body["engine"]["retries_scheduled"], 3);
    Ok(())
}

#[tokio::test]
async fn empty_queue_has_zero_age() -> Result<()> {
    let app = TestApp::new();

    let (status, body) = app.get("/health/queue").await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"], 0);
    assert_eq!(body["oldest_pending_age_seconds"], 0);
    Ok(())
}

#[tokio::test]
async fn responses_carry_a_request_id() -> Result<()> {
    let app = TestApp::new();

    let response = app
        .app
        .clone()
        .oneshot(Request::builder().uri("/health/live").body(Body::empty())?)
        .await?;

    let request_id = response.headers().get("x-request-id").and_then(|v| v.to_str().ok());
    assert!(request_id.is_some_and(|id| uuid::Uuid::parse_str(id).is_ok()));
    Ok(())
}
