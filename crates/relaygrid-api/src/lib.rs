//! relaygrid-api: REST API over the service directory.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/registry/v1/services` | Services with up/expiring counts |
//! | GET | `/registry/v1/services/{service}/instances` | Live instances |
//! | POST | `/registry/v1/services/{service}/instances` | Register (idempotent) |
//! | GET | `/registry/v1/services/{service}/instances/{id}` | One instance |
//! | DELETE | `/registry/v1/services/{service}/instances/{id}` | Deregister |
//! | PUT | `/registry/v1/services/{service}/instances/{id}/heartbeat` | Renew lease |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, put};
use relaygrid_registry::Registry;

pub use handlers::{ApiResponse, RegisterRequest};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
}

/// Build the registry API router.
pub fn build_router(registry: Arc<Registry>) -> Router {
    let state = ApiState { registry };

    let api_routes = Router::new()
        .route("/services", get(handlers::list_services))
        .route(
            "/services/{service}/instances",
            get(handlers::list_instances).post(handlers::register_instance),
        )
        .route(
            "/services/{service}/instances/{id}",
            get(handlers::get_instance).delete(handlers::deregister_instance),
        )
        .route(
            "/services/{service}/instances/{id}/heartbeat",
            put(handlers::heartbeat),
        )
        .with_state(state);

    Router::new()
        .nest("/registry/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
