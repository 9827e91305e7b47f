// Module: http
// HTTP/JSON read API and the WebSocket transport adapter

pub mod error;
pub mod health;
pub mod metrics;
pub mod state;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use statecast_core::Config;
use statecast_relay::hooks::StaticTokenVerifier;
use statecast_relay::Relay;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    /// Largest accepted WebSocket frame and HTTP body, in bytes
    pub max_message_size: usize,
    /// Bearer tokens accepted by `PUT /state/{key}`. `None` leaves it open.
    pub ingress_tokens: Option<Arc<StaticTokenVerifier>>,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, config: &Config) -> Self {
        let ingress_tokens = (!config.auth.tokens.is_empty())
            .then(|| Arc::new(StaticTokenVerifier::new(config.auth.tokens.clone())));

        Self {
            relay,
            max_message_size: config.server.max_message_size,
            ingress_tokens,
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.max_message_size;

    let router = Router::new()
        .merge(health::create_health_router())
        .merge(metrics::create_metrics_router())
        .merge(state::create_state_router())
        .route("/ws", get(websocket::websocket_handler));

    // Apply layers before state
    let router = router
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    router.with_state(state)
}
