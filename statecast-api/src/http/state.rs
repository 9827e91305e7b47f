//! Read-side state endpoints and producer ingress
//!
//! All endpoints operate on the same State Cache the relay fans out from, so
//! readers observe the same versioned records subscribers receive.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use statecast_core::StateRecord;
use tracing::debug;

use crate::http::{AppError, AppResult, AppState};

/// Upper bound on keys accepted by one `GET /state?keys=` request
const MAX_KEYS_PER_REQUEST: usize = 1000;

pub fn create_state_router() -> Router<AppState> {
    Router::new()
        .route("/state", get(list_state))
        .route("/state/count", get(count_state))
        .route("/state/{key}", get(get_state).put(put_state))
}

#[derive(Debug, Deserialize)]
pub struct StateQuery {
    /// Comma separated keys
    pub keys: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub total: u64,
}

/// `GET /state?keys=a,b` returns one slot per key in request order, `null`
/// where absent. Without keys, every cached record.
pub async fn list_state(
    State(state): State<AppState>,
    Query(query): Query<StateQuery>,
) -> AppResult<Response> {
    let cache = state.relay.cache();

    let keys: Vec<&str> = query
        .keys
        .as_deref()
        .map(|raw| raw.split(',').map(str::trim).filter(|k| !k.is_empty()).collect())
        .unwrap_or_default();

    if keys.is_empty() {
        return Ok(Json(cache.all()).into_response());
    }
    if keys.len() > MAX_KEYS_PER_REQUEST {
        return Err(AppError::bad_request(format!(
            "At most {MAX_KEYS_PER_REQUEST} keys per request"
        )));
    }

    Ok(Json(cache.get_many(&keys)).into_response())
}

pub async fn count_state(State(state): State<AppState>) -> Json<CountResponse> {
    Json(CountResponse {
        total: state.relay.cache().size(),
    })
}

pub async fn get_state(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> AppResult<Json<StateRecord>> {
    state
        .relay
        .cache()
        .get(&key)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("No state for key '{key}'")))
}

/// `PUT /state/{key}` stores the body as the key's new payload
pub async fn put_state(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> AppResult<Json<StateRecord>> {
    if let Some(verifier) = &state.ingress_tokens {
        let token = bearer_token(&headers)
            .ok_or_else(|| AppError::unauthorized("Missing bearer token"))?;
        if !verifier.contains(token) {
            return Err(AppError::unauthorized("Invalid token"));
        }
    }

    let record = state.relay.cache().set(key, payload);
    debug!(key = %record.key, version = record.version, "State written via HTTP");
    Ok(Json(record))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
