//! Degraded responses returned instead of a backend reply.

use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use relaygrid_core::epoch_millis;

/// Set on every fallback response so clients can tell it from a backend 503.
pub const FALLBACK_HEADER: &str = "x-relaygrid-fallback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The breaker refused the attempt; no instance was contacted.
    CircuitOpen,
    /// The directory returned no live instance.
    NoInstance,
    /// Every allowed attempt failed.
    AttemptsExhausted,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::CircuitOpen => "circuit_open",
            FallbackReason::NoInstance => "no_instance",
            FallbackReason::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

#[derive(Debug, Serialize)]
struct FallbackBody<'a> {
    status: u16,
    error: &'static str,
    message: String,
    reason: FallbackReason,
    service: &'a str,
    timestamp: u64,
}

/// 503 with a JSON body explaining which service is degraded.
pub fn fallback_response(service: &str, reason: FallbackReason) -> Response {
    let body = FallbackBody {
        status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
        error: "Service Unavailable",
        message: format!("{service} is currently unavailable. Please try again later."),
        reason,
        service,
        timestamp: epoch_millis(),
    };
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    response
        .headers_mut()
        .insert(FALLBACK_HEADER, HeaderValue::from_static(reason.as_str()));
    response
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: u16,
    error: String,
    message: String,
    timestamp: u64,
}

/// Plain JSON error produced by the gateway itself (404, 413, 429, ...).
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        status: status.as_u16(),
        error: status.canonical_reason().unwrap_or("Error").to_string(),
        message: message.into(),
        timestamp: epoch_millis(),
    };
    (status, Json(body)).into_response()
}
