// Module: http
// HTTP/WebSocket surface of the signaling gateway

pub mod websocket;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use aula_sfu::{RoomSummary, SfuManager};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SfuManager>,
}

/// Create the HTTP router with all routes
pub fn create_router(manager: Arc<SfuManager>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(health))
        .route("/rooms", get(list_rooms))
        .route("/ws", get(websocket::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { manager })
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    Json(state.manager.room_summaries())
}
