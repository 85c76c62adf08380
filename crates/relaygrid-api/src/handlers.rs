//! REST API handlers.
//!
//! Each handler calls into the `Registry` and answers with the
//! `{success, data, error}` envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use relaygrid_registry::RegistryError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn registry_error(e: &RegistryError) -> Response {
    let status = match e {
        RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
        RegistryError::InvalidInstance(_) => StatusCode::BAD_REQUEST,
    };
    error_response(&e.to_string(), status)
}

/// Body of a registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
}

// ── Services ───────────────────────────────────────────────────

/// GET /registry/v1/services
pub async fn list_services(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.registry.list_services()).into_response()
}

// ── Instances ──────────────────────────────────────────────────

/// GET /registry/v1/services/{service}/instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> Response {
    ApiResponse::ok(state.registry.list_instances(&service)).into_response()
}

/// GET /registry/v1/services/{service}/instances/{id}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path((service, id)): Path<(String, String)>,
) -> Response {
    match state.registry.get_instance(&service, &id) {
        Some(instance) => ApiResponse::ok(instance).into_response(),
        None => error_response("instance not found", StatusCode::NOT_FOUND),
    }
}

/// POST /registry/v1/services/{service}/instances
pub async fn register_instance(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    match state
        .registry
        .register(&service, &req.instance_id, &req.host, req.port)
    {
        Ok(instance) => (StatusCode::CREATED, ApiResponse::ok(instance)).into_response(),
        Err(e) => registry_error(&e),
    }
}

/// PUT /registry/v1/services/{service}/instances/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    Path((service, id)): Path<(String, String)>,
) -> Response {
    match state.registry.heartbeat(&service, &id) {
        Ok(()) => ApiResponse::ok("renewed").into_response(),
        Err(e) => {
            debug!(%service, instance_id = %id, "heartbeat for unknown instance");
            registry_error(&e)
        }
    }
}

/// DELETE /registry/v1/services/{service}/instances/{id}
///
/// Idempotent: `data` tells whether an entry was actually removed.
pub async fn deregister_instance(
    State(state): State<ApiState>,
    Path((service, id)): Path<(String, String)>,
) -> Response {
    let removed = state.registry.deregister(&service, &id);
    if !removed {
        debug!(%service, instance_id = %id, "deregister for unknown instance");
    }
    ApiResponse::ok(removed).into_response()
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygrid_core::RegistrySettings;
    use relaygrid_registry::Registry;
    use std::sync::Arc;

    fn test_state() -> ApiState {
        ApiState {
            registry: Arc::new(Registry::new(&RegistrySettings::default())),
        }
    }

    #[tokio::test]
    async fn list_services_empty() {
        let resp = list_services(State(test_state())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let state = test_state();
        let req = RegisterRequest {
            instance_id: "acc-1".to_string(),
            host: "10.0.0.1".to_string(),
            port: 8080,
        };

        for _ in 0..2 {
            let resp = register_instance(
                State(state.clone()),
                Path("accounts-service".to_string()),
                Json(req.clone()),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::CREATED);
        }
        assert_eq!(state.registry.list_instances("accounts-service").len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_maps_not_found() {
        let resp = heartbeat(
            State(test_state()),
            Path(("svc".to_string(), "nope".to_string())),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deregister_unknown_instance_succeeds() {
        let resp = deregister_instance(
            State(test_state()),
            Path(("svc".to_string(), "nope".to_string())),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn envelope_omits_absent_fields() {
        let json = serde_json::to_value(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some("boom".to_string()),
        })
        .unwrap();
        assert_eq!(json, json!({ "success": false, "error": "boom" }));
    }
}
