//! Axum HTTP handlers for the web server
//!
//! Provides the JSON-RPC endpoint and general metadata endpoints.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::{errors::AppError, AppState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ServicesResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub services: Vec<String>,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn services(State(state): State<AppState>) -> Json<ServicesResponse> {
    Json(ServicesResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        services: state.dispatcher.services(),
    })
}

/// Protocol errors are reported in the body; the status is always 200 once the body is JSON.
pub async fn rpc_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if !is_json(&headers) {
        return Err(AppError::unsupported_media_type(
            "unsupported_media_type",
            "content type must be application/json",
        ));
    }

    let payload = state.dispatcher.handle(&body).await;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        payload,
    )
        .into_response())
}

/// Loose match on the raw header so parameterised or listed values still qualify.
fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("application/json"))
}
