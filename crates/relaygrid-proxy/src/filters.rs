//! Request filters wrapped around the gateway router.
//!
//! Outermost first: optional CORS, correlation id, access log, optional
//! per-client rate limit.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{Instrument, info, info_span, warn};

use relaygrid_core::{CorsSettings, RateLimitSettings};

use crate::fallback::{FALLBACK_HEADER, error_response};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Correlation id of the current request, as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

/// Which instance served a response, as a response extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedTo {
    pub service: String,
    pub instance_id: String,
    pub endpoint: String,
}

/// Reuse the caller's correlation id or mint one, and echo it back.
pub async fn correlation_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let header = HeaderValue::from_str(&id).ok();
    if let Some(value) = &header {
        req.headers_mut().insert(CORRELATION_HEADER, value.clone());
    }
    req.extensions_mut().insert(CorrelationId(id.clone()));

    let span = info_span!("request", correlation_id = %id);
    let mut response = next.run(req).instrument(span).await;
    if let Some(value) = header {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

/// One line per request: method, path, source, target, status, duration.
pub async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let source = client_addr(&req)
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());
    let start = Instant::now();

    let response = next.run(req).await;

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let status = response.status().as_u16();
    match response.extensions().get::<ForwardedTo>() {
        Some(target) => info!(
            %method,
            %path,
            %source,
            service = %target.service,
            instance = %target.instance_id,
            endpoint = %target.endpoint,
            status,
            elapsed_ms,
            "request completed"
        ),
        None => info!(%method, %path, %source, status, elapsed_ms, "request completed"),
    }
    response
}

fn client_addr(req: &Request) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Token bucket per client IP.
pub struct ClientRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
    checks: AtomicU64,
}

const PRUNE_EVERY: u64 = 1024;

impl std::fmt::Debug for ClientRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRateLimiter")
            .field("tracked_clients", &self.limiter.len())
            .finish()
    }
}

impl ClientRateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Option<Self> {
        let rate = NonZeroU32::new(settings.requests_per_second)?;
        let burst = settings
            .burst
            .and_then(NonZeroU32::new)
            .unwrap_or(rate);
        let quota = Quota::per_second(rate).allow_burst(burst);
        Some(Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
            checks: AtomicU64::new(0),
        })
    }

    /// `Err` carries how long the client should wait.
    pub fn check(&self, client: &str) -> Result<(), Duration> {
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.limiter.retain_recent();
        }
        self.limiter
            .check_key(&client.to_string())
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }
}

pub async fn rate_limit(
    State(limiter): State<Arc<ClientRateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let client = client_addr(&req)
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    match limiter.check(&client) {
        Ok(()) => next.run(req).await,
        Err(wait) => {
            warn!(%client, wait_ms = wait.as_millis() as u64, "rate limit exceeded");
            let mut response =
                error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
            let secs = wait.as_secs_f64().ceil().max(1.0) as u64;
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
            response
        }
    }
}

/// Build the cross-origin layer. Entries are checked when the config
/// loads; any that still fail to parse are skipped.
pub fn cors_layer(settings: &CorsSettings) -> CorsLayer {
    let origins = if settings.any_origin() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            settings
                .allowed_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };
    let methods: Vec<Method> = settings
        .allowed_methods
        .iter()
        .filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
        .collect();
    let headers: Vec<HeaderName> = settings
        .allowed_headers
        .iter()
        .filter_map(|h| HeaderName::from_bytes(h.as_bytes()).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers([
            HeaderName::from_static(CORRELATION_HEADER),
            HeaderName::from_static(FALLBACK_HEADER),
        ])
        .max_age(settings.max_age)
}
