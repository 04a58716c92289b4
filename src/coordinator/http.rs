//! HTTP API for the coordination service
//!
//! The public contract consumed by external storage/compute nodes:
//!
//! - `POST /v1/id` — generate a ScarabId
//! - `POST /v1/counters/{id}/increment` — atomic counter increment
//! - `GET  /v1/counters/{id}` — read a counter at its owner
//! - `POST /v1/epochs/{partition}` — allocate a partition epoch
//! - `GET  /v1/status`, `GET /health` — operational surface
//!
//! Counter ids are percent-encoded into the path. A request landing on a
//! non-owner answers 307 with an `owner_hint` (also in the Location
//! header) for mechanical client-side redirect.

use crate::common::Error;
use crate::coordinator::service::CoordService;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct CoordState {
    pub service: Arc<CoordService>,
}

/// Build the public API router.
pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/id", post(generate_id))
        .route("/v1/counters/:id/increment", post(increment_counter))
        .route("/v1/counters/:id", get(get_counter))
        .route("/v1/epochs/:partition", post(allocate_epoch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct IdResponse {
    id: u64,
    timestamp_ms: u64,
    node_id: u16,
    sequence: u16,
}

#[derive(Debug, Deserialize)]
struct IncrementRequest {
    #[serde(default = "default_delta")]
    delta: u64,
}

fn default_delta() -> u64 {
    1
}

#[derive(Debug, Serialize)]
struct IncrementResponse {
    value: u64,
    term: u64,
}

#[derive(Debug, Serialize)]
struct EpochResponse {
    epoch: u64,
    term: u64,
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<CoordState>) -> impl IntoResponse {
    Json(state.service.status())
}

async fn generate_id(State(state): State<CoordState>) -> Response {
    match state.service.generate_id().await {
        Ok(id) => Json(IdResponse {
            id: id.as_u64(),
            timestamp_ms: id.timestamp_ms(),
            node_id: id.node_id(),
            sequence: id.sequence(),
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn increment_counter(
    State(state): State<CoordState>,
    Path(counter_id): Path<String>,
    body: Option<Json<IncrementRequest>>,
) -> Response {
    let delta = body.map(|Json(req)| req.delta).unwrap_or(1);
    match state.service.increment_counter(&counter_id, delta).await {
        Ok((value, term)) => Json(IncrementResponse { value, term }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_counter(State(state): State<CoordState>, Path(counter_id): Path<String>) -> Response {
    match state.service.get_counter(&counter_id).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

async fn allocate_epoch(
    State(state): State<CoordState>,
    Path(partition): Path<String>,
) -> Response {
    match state.service.allocate_epoch(&partition).await {
        Ok((epoch, term)) => Json(EpochResponse { epoch, term }).into_response(),
        Err(e) => error_response(e),
    }
}

/// Map a service error onto the wire: typed status code, JSON body, and
/// for NotLeader a Location header carrying the owner hint.
fn error_response(err: Error) -> Response {
    let status = err.to_http_status();
    let mut body = json!({ "error": err.to_string() });
    let mut location = None;
    if let Error::NotLeader { owner_hint } = &err {
        body["owner_hint"] = json!(owner_hint);
        if owner_hint.starts_with("http") {
            location = Some(owner_hint.clone());
        }
    }

    let mut response = (status, Json(body)).into_response();
    if let Some(hint) = location {
        if let Ok(value) = hint.parse() {
            response.headers_mut().insert(header::LOCATION, value);
        }
    }
    response
}
