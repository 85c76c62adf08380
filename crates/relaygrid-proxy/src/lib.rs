//! relaygrid-proxy: the routing gateway.
//!
//! Each inbound request is matched against a static route table, resolved
//! to a live instance through an [`InstanceSource`](relaygrid_core::InstanceSource),
//! and forwarded with a hard timeout. Failed attempts are retried on a
//! different instance and recorded by a per-service circuit breaker; when
//! nothing can serve the request a 503 fallback is returned instead.
//!
//! ```text
//!  client ──▶ correlation id ──▶ access log ──▶ rate limit ──▶ Gateway::handle
//!                                                                │
//!                          RouteTable ◀── match_route ◀──────────┤
//!                          LoadBalancer ◀── select_instance ◀────┤
//!                          CircuitBreaker ◀── permit/outcome ◀───┤
//!                          Forwarder ──▶ backend instance ◀──────┘
//! ```
//!
//! # Management routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/gateway/health` | Liveness and route count |
//! | GET | `/gateway/routes` | Route table, longest prefix first |
//! | GET | `/gateway/circuits` | Breaker state per service |
//!
//! Every other path is proxied.

pub mod balancer;
pub mod circuit;
pub mod error;
pub mod fallback;
pub mod filters;
pub mod forward;
pub mod gateway;
pub mod route;

pub use balancer::LoadBalancer;
pub use circuit::{CircuitBreaker, CircuitBreakers, CircuitSnapshot, CircuitStatus, Outcome, Permit};
pub use error::{ProxyError, ProxyResult};
pub use fallback::{FALLBACK_HEADER, FallbackReason, error_response, fallback_response};
pub use filters::{CORRELATION_HEADER, ClientRateLimiter, CorrelationId, ForwardedTo};
pub use forward::{Forwarder, OutboundRequest};
pub use gateway::{Gateway, build_router};
pub use route::{Route, RouteTable};
