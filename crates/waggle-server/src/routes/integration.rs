//! Operator surface over the integration lifecycle and the dead-letter
//! queue. Unlike the webhook route, these endpoints do return 5xx so
//! failures are visible.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(integration_status))
        .route("/initialize", post(initialize))
        .route("/shutdown", post(shutdown))
        .route("/reinitialize", post(reinitialize))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/requeue-failed", post(requeue_failed))
        .route("/queue/clear-failed", post(clear_failed))
}

async fn integration_status(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.get_status().await)
}

async fn initialize(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.initialize().await)
}

async fn shutdown(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.shutdown().await)
}

async fn reinitialize(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.reinitialize().await)
}

async fn queue_stats(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.queue.get_queue_stats().await {
        Ok(stats) => Ok(Json(serde_json::to_value(&stats).unwrap_or(Value::Null))),
        Err(e) => Err(internal_error(e)),
    }
}

async fn requeue_failed(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.queue.requeue_failed().await {
        Ok(count) => Ok(Json(json!({"requeued": count}))),
        Err(e) => Err(internal_error(e)),
    }
}

async fn clear_failed(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.queue.clear_failed().await {
        Ok(count) => Ok(Json(json!({"cleared": count}))),
        Err(e) => Err(internal_error(e)),
    }
}

fn internal_error(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    tracing::error!("admin integration endpoint failed: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"detail": e.to_string()})),
    )
}
