//! Health and intake HTTP server.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. Handler execution
//!
//! Routes:
//! - `GET /health/live` answers as long as the process runs
//! - `GET /health/ready` pings the queue store
//! - `GET /health/queue` reports backlog and engine counters
//! - `POST /events` hands an event record to the intake channel

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use courier_core::Clock;
use courier_delivery::{ingest::EventRecord, storage::DeliveryStorage, EngineStats};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    storage: Arc<dyn DeliveryStorage>,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
    intake: Option<mpsc::Sender<EventRecord>>,
}

impl AppState {
    /// State without an intake channel; `POST /events` answers 503.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        stats: Arc<RwLock<EngineStats>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, stats, clock, intake: None }
    }

    /// Routes `POST /events` into `intake`.
    #[must_use]
    pub fn with_intake(mut self, intake: mpsc::Sender<EventRecord>) -> Self {
        self.intake = Some(intake);
        self
    }
}

/// Overall readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All dependencies reachable.
    Healthy,
    /// A required dependency is down.
    Unhealthy,
}

/// Component-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is reachable.
    Up,
    /// Component failed its check.
    Down,
}

/// Result of one dependency check.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Error message if down
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Body of `/health/ready`.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// Overall status
    pub status: HealthStatus,
    /// When the check ran
    pub timestamp: DateTime<Utc>,
    /// Queue store check
    pub database: ComponentHealth,
    /// Service version
    pub version: String,
}

/// Body of `/health/queue`.
#[derive(Debug, Serialize)]
pub struct QueueHealthResponse {
    /// Items waiting for delivery.
    pub pending: i64,
    /// Items claimed by a worker.
    pub processing: i64,
    /// Age of the oldest pending item in seconds.
    pub oldest_pending_age_seconds: u64,
    /// In-process engine counters.
    pub engine: EngineStats,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

/// Builds the router with all routes and middleware.
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let health_routes = Router::new()
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/health/queue", get(queue_health));

    Router::new()
        .merge(health_routes)
        .route("/events", post(accept_event))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an `X-Request-Id` header to every response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

async fn liveness(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": env!("CARGO_PKG_NAME"),
    }))
}

async fn readiness(State(state): State<AppState>) -> Response {
    let started = state.clock.now();
    let database = match state.storage.ping().await {
        Ok(()) => ComponentHealth {
            status: ComponentStatus::Up,
            message: None,
            response_time_ms: elapsed_ms(&state, started),
        },
        Err(e) => {
            error!(error = %e, "readiness check failed");
            ComponentHealth {
                status: ComponentStatus::Down,
                message: Some(e.to_string()),
                response_time_ms: elapsed_ms(&state, started),
            }
        },
    };

    let (status, code) = match database.status {
        ComponentStatus::Up => (HealthStatus::Healthy, StatusCode::OK),
        ComponentStatus::Down => (HealthStatus::Unhealthy, StatusCode::SERVICE_UNAVAILABLE),
    };

    let body = ReadinessResponse {
        status,
        timestamp: state.clock.now_utc(),
        database,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    (code, Json(body)).into_response()
}

async fn queue_health(State(state): State<AppState>) -> Response {
    let backlog = match state.storage.backlog().await {
        Ok(backlog) => backlog,
        Err(e) => {
            error!(error = %e, "backlog query failed");
            let body = serde_json::json!({ "error": e.to_string(), "code": e.code() });
            return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
        },
    };

    let now = state.clock.now_utc();
    let body = QueueHealthResponse {
        pending: backlog.pending,
        processing: backlog.processing,
        oldest_pending_age_seconds: backlog.oldest_pending_age(now).as_secs(),
        engine: state.stats.read().await.clone(),
        timestamp: now,
    };
    (StatusCode::OK, Json(body)).into_response()
}

async fn accept_event(State(state): State<AppState>, Json(record): Json<EventRecord>) -> Response {
    let Some(intake) = state.intake.as_ref() else {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "error": "intake disabled" })))
            .into_response();
    };

    let user_id = record.user_id;
    match intake.try_send(record) {
        Ok(()) => {
            debug!(user_id, "event accepted");
            (StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "accepted" }))).into_response()
        },
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(user_id, "intake channel full");
            (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "error": "intake busy" })))
                .into_response()
        },
        Err(mpsc::error::TrySendError::Closed(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "error": "intake closed" })))
                .into_response()
        },
    }
}

fn elapsed_ms(state: &AppState, started: std::time::Instant) -> u64 {
    let elapsed = state.clock.now().saturating_duration_since(started);
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Serves `app` on `addr` until `shutdown` fires.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound.
pub async fn start_server(
    app: Router,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("HTTP server listening on {}", actual_addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for CTRL+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
