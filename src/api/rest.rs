// =============================================================================
// REST control surface — bearer-token-protected mirror of the chat-bot
// command surface (SPEC_FULL.md §6: "a small authenticated REST surface...
// for operators who prefer HTTP — both are thin callers into the same
// executor/scheduler methods, so neither constitutes a second implementation
// of core logic").
//
// CORS is configured permissively; tighten `allowed_origins` in production.
// =============================================================================

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::executor::Executor;
use crate::persistence::Persistence;
use crate::scheduler::Scheduler;

use super::auth::AuthBearer;

#[derive(Clone)]
pub struct ApiState {
    executor: Arc<Executor>,
    scheduler: Arc<Scheduler>,
    persistence: Arc<Persistence>,
}

pub fn router(executor: Arc<Executor>, scheduler: Arc<Scheduler>, persistence: Arc<Persistence>) -> Router {
    let state = ApiState { executor, scheduler, persistence };

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/signal", get(signal))
        .route("/api/v1/balance", get(balance))
        .route("/api/v1/logs", get(logs))
        .route("/api/v1/control/pause", post(pause))
        .route("/api/v1/control/resume", post(resume))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn positions(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    match state.executor.get_portfolio_value().await {
        Ok(snapshot) => Json(json!({ "cash": snapshot.cash, "positions": snapshot.positions })).into_response(),
        Err(e) => (
            axum::http::StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn balance(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    match state.executor.get_portfolio_value().await {
        Ok(snapshot) => Json(json!({ "cash": snapshot.cash })).into_response(),
        Err(e) => (
            axum::http::StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn signal(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    let signal = state.executor.compute_signal().await;
    Json(json!({
        "kind": signal.kind.as_str(),
        "target": signal.target.map(|t| t.to_string()),
        "reason": signal.reason,
    }))
}

#[derive(Serialize)]
struct LogsResponse {
    events: Vec<serde_json::Value>,
}

async fn logs(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    let events = state.persistence.get_events(50, None);
    let events = events
        .into_iter()
        .map(|e| json!({ "timestamp": e.timestamp, "level": e.level, "event_type": e.event_type, "detail": e.detail }))
        .collect();
    Json(LogsResponse { events })
}

async fn pause(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    state.scheduler.pause();
    Json(json!({ "status": "paused" }))
}

async fn resume(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    state.scheduler.resume();
    Json(json!({ "status": "resumed" }))
}
