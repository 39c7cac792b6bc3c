use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use realtime_service::{handle_socket, EventFabric, WsQuery};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;
use trigger_service::{TriggerManager, TriggerRequest};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub triggers: Arc<TriggerManager>,
    pub fabric: Arc<EventFabric>,
}

/// Create and configure the HTTP server
pub fn create_server(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .route("/api/v1/triggers/execute", post(execute_trigger))
        .route("/api/v1/triggers/execute-and-wait", post(execute_and_wait))
        .route("/api/v1/triggers/stats", get(trigger_stats))
        .route("/api/v1/executions/:id/cancel", post(cancel_execution))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn execute_trigger(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> impl IntoResponse {
    Json(state.triggers.execute(request).await)
}

#[derive(Debug, Deserialize)]
struct WaitParams {
    timeout_ms: Option<u64>,
}

async fn execute_and_wait(
    State(state): State<AppState>,
    Query(params): Query<WaitParams>,
    Json(request): Json<TriggerRequest>,
) -> impl IntoResponse {
    Json(
        state
            .triggers
            .execute_and_wait(request, params.timeout_ms)
            .await,
    )
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> impl IntoResponse {
    let cancelled = state.triggers.cancel(execution_id).await;
    Json(json!({ "success": cancelled, "execution_id": execution_id }))
}

async fn trigger_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.triggers.stats().await)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let fabric = state.fabric.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, fabric, query))
}
