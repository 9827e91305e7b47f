use axum::{
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::http::{AppResult, AppState};

pub fn create_metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Prometheus text exposition of the relay metrics
pub async fn metrics_handler() -> AppResult<impl IntoResponse> {
    let body = statecast_relay::metrics::gather()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
