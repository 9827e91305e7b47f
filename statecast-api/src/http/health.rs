//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Live records in this instance's State Cache
    pub cached: u64,
    /// Open client connections on this instance
    pub connections: usize,
    pub node_id: String,
}

pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        cached: state.relay.cache().size(),
        connections: state.relay.connection_count(),
        node_id: state.relay.node_id().to_string(),
    })
}
