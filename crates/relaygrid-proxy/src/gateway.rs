//! The gateway: route, pick an instance, forward, retry, degrade.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;
use tracing::{debug, warn};

use relaygrid_core::{CorsSettings, GatewayConfig, InstanceSource, ServiceInstance, SharedClock, SystemClock};

use crate::balancer::LoadBalancer;
use crate::circuit::{CircuitBreakers, Outcome};
use crate::error::{ProxyError, ProxyResult};
use crate::fallback::{FallbackReason, error_response, fallback_response};
use crate::filters::{
    ClientRateLimiter, CorrelationId, ForwardedTo, access_log, correlation_id, cors_layer,
    rate_limit,
};
use crate::forward::{Forwarder, OutboundRequest};
use crate::route::{Route, RouteTable};

/// Shared, immutable-after-start gateway state.
pub struct Gateway {
    routes: RouteTable,
    source: Arc<dyn InstanceSource>,
    balancer: LoadBalancer,
    breakers: CircuitBreakers,
    forwarder: Forwarder,
    max_retries: u32,
    max_body_bytes: usize,
    rate_limiter: Option<Arc<ClientRateLimiter>>,
    cors: Option<CorsSettings>,
}

impl Gateway {
    pub fn new(config: &GatewayConfig, source: Arc<dyn InstanceSource>) -> Self {
        Self::with_clock(config, source, SystemClock::shared())
    }

    /// Build with an explicit clock for the circuit breakers.
    pub fn with_clock(
        config: &GatewayConfig,
        source: Arc<dyn InstanceSource>,
        clock: SharedClock,
    ) -> Self {
        let settings = &config.gateway;
        Self {
            routes: RouteTable::new(&config.routes),
            source,
            balancer: LoadBalancer::new(settings.load_balancer),
            breakers: CircuitBreakers::new(config.circuit_breaker.clone(), clock),
            forwarder: Forwarder::new(settings.forward_timeout)
                .with_response_limit(settings.max_response_bytes),
            max_retries: settings.max_retries,
            max_body_bytes: settings.max_body_bytes,
            rate_limiter: settings
                .rate_limit
                .as_ref()
                .and_then(ClientRateLimiter::new)
                .map(Arc::new),
            cors: settings.cors.clone(),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn match_route(&self, path: &str) -> ProxyResult<&Route> {
        self.routes.match_route(path)
    }

    pub fn select_instance(&self, service: &str) -> ProxyResult<ServiceInstance> {
        self.select_instance_excluding(service, &[])
    }

    /// Like `select_instance`, never returning an id listed in `exclude`.
    pub fn select_instance_excluding(
        &self,
        service: &str,
        exclude: &[String],
    ) -> ProxyResult<ServiceInstance> {
        let instances = self.source.live_instances(service);
        self.balancer
            .choose(service, &instances, exclude)
            .cloned()
            .ok_or_else(|| ProxyError::NoInstanceAvailable(service.to_string()))
    }

    /// Full request path through the gateway. Never fails: every error
    /// becomes a response.
    pub async fn handle(&self, req: Request) -> Response {
        let path = req.uri().path().to_string();
        let route = match self.match_route(&path) {
            Ok(route) => route,
            Err(e) => {
                debug!(%path, "no route");
                return error_response(StatusCode::NOT_FOUND, e.to_string());
            }
        };

        let outbound = match self.prepare(route, req).await {
            Ok(outbound) => outbound,
            Err(e @ ProxyError::BodyTooLarge(_)) => {
                return error_response(StatusCode::PAYLOAD_TOO_LARGE, e.to_string());
            }
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        };

        self.dispatch(&route.service, &outbound).await
    }

    async fn prepare(&self, route: &Route, req: Request) -> ProxyResult<OutboundRequest> {
        let (parts, body) = req.into_parts();

        let mut path_and_query = route.rewrite_path(parts.uri.path());
        if let Some(query) = parts.uri.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let body = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|_| ProxyError::BodyTooLarge(self.max_body_bytes))?;

        let client = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let host = parts.headers.get(header::HOST).cloned();
        let correlation = parts.extensions.get::<CorrelationId>().cloned();

        let mut outbound = OutboundRequest::new(parts.method, path_and_query, parts.headers, body);
        outbound.set_forwarded(client, host);
        if let Some(CorrelationId(id)) = correlation {
            outbound.set_correlation_id(&id);
        }
        Ok(outbound)
    }

    /// Send `outbound` to `service` with breaker, retry and fallback.
    pub async fn dispatch(&self, service: &str, outbound: &OutboundRequest) -> Response {
        let breaker = self.breakers.get(service);
        let mut tried: Vec<String> = Vec::new();

        for attempt in 0..=self.max_retries {
            let permit = match breaker
                .try_acquire()
                .ok_or_else(|| ProxyError::CircuitOpen(service.to_string()))
            {
                Ok(permit) => permit,
                Err(e) => {
                    debug!(service, attempt, error = %e, "failing fast");
                    return fallback_response(service, FallbackReason::CircuitOpen);
                }
            };

            let instance = match self.select_instance_excluding(service, &tried) {
                Ok(instance) => instance,
                Err(_) if tried.is_empty() => {
                    warn!(service, "no live instance");
                    return fallback_response(service, FallbackReason::NoInstance);
                }
                Err(_) => break,
            };
            tried.push(instance.instance_id.clone());

            match self.forwarder.forward(outbound, &instance).await {
                Ok(response) if breaker.is_failure_status(response.status().as_u16()) => {
                    warn!(
                        service,
                        instance = %instance.instance_id,
                        status = response.status().as_u16(),
                        attempt,
                        "backend returned failure status"
                    );
                    permit.record(Outcome::Failure);
                }
                Ok(mut response) => {
                    permit.record(Outcome::Success);
                    response.extensions_mut().insert(ForwardedTo {
                        service: service.to_string(),
                        endpoint: instance.endpoint(),
                        instance_id: instance.instance_id,
                    });
                    return response;
                }
                Err(e) => {
                    warn!(service, instance = %instance.instance_id, attempt, error = %e, "forward failed");
                    if e.is_backend_failure() {
                        permit.record(Outcome::Failure);
                    }
                }
            }
        }

        warn!(service, attempts = tried.len(), "attempts exhausted");
        fallback_response(service, FallbackReason::AttemptsExhausted)
    }

    fn rate_limiter(&self) -> Option<Arc<ClientRateLimiter>> {
        self.rate_limiter.clone()
    }
}

/// Gateway router: management endpoints, catch-all proxy and filters.
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    let mut router = Router::new()
        .route("/gateway/health", get(health))
        .route("/gateway/routes", get(list_routes))
        .route("/gateway/circuits", get(list_circuits))
        .fallback(proxy)
        .with_state(Arc::clone(&gateway));

    if let Some(limiter) = gateway.rate_limiter() {
        router = router.layer(from_fn_with_state(limiter, rate_limit));
    }
    router = router.layer(from_fn(access_log)).layer(from_fn(correlation_id));
    match gateway.cors.as_ref() {
        Some(cors) => router.layer(cors_layer(cors)),
        None => router,
    }
}

async fn proxy(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
    gateway.handle(req).await
}

async fn health(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(json!({
        "status": "up",
        "routes": gateway.routes().routes().len(),
    }))
}

async fn list_routes(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(gateway.routes().routes().to_vec())
}

async fn list_circuits(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(gateway.breakers().snapshots())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{HeaderMap, Method};
    use http_body_util::BodyExt;
    use relaygrid_core::{BreakerParams, InstanceStatus, ManualClock, RouteConfig};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    use crate::circuit::CircuitStatus;
    use crate::fallback::FALLBACK_HEADER;
    use crate::filters::CORRELATION_HEADER;

    #[derive(Default)]
    struct StaticSource {
        services: Mutex<HashMap<String, Vec<ServiceInstance>>>,
    }

    impl StaticSource {
        fn add(&self, service: &str, id: &str, port: u16) {
            let instance = ServiceInstance {
                service_name: service.to_string(),
                instance_id: id.to_string(),
                host: "127.0.0.1".to_string(),
                port,
                status: InstanceStatus::Up,
                registered_at_ms: 0,
                last_heartbeat_ms: 0,
            };
            self.services
                .lock()
                .unwrap()
                .entry(service.to_string())
                .or_default()
                .push(instance);
        }
    }

    impl InstanceSource for StaticSource {
        fn live_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
            self.services
                .lock()
                .unwrap()
                .get(service_name)
                .cloned()
                .unwrap_or_default()
        }
    }

    async fn serve(app: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    /// Replies with the path it saw and the correlation id it received.
    fn echo_backend(name: &'static str) -> Router {
        Router::new().fallback(move |req: Request| async move {
            let correlation = req
                .headers()
                .get(CORRELATION_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let seen = req
                .uri()
                .path_and_query()
                .map(|p| p.to_string())
                .unwrap_or_default();
            Json(json!({ "backend": name, "path": seen, "correlation": correlation }))
        })
    }

    fn slow_backend() -> Router {
        Router::new().fallback(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "late"
        })
    }

    fn config(routes: &[(&str, &str)]) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.routes = routes
            .iter()
            .map(|(path, service)| RouteConfig {
                path: path.to_string(),
                service: service.to_string(),
                strip_prefix: 0,
            })
            .collect();
        config.gateway.forward_timeout = Duration::from_millis(300);
        config
    }

    fn get_request(uri: &str) -> Request {
        http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn round_trip_propagates_correlation_id() {
        let port = serve(echo_backend("a")).await;
        let source = Arc::new(StaticSource::default());
        source.add("accounts-service", "acc-1", port);

        let gateway = Arc::new(Gateway::new(
            &config(&[("/api/v1/accounts/**", "accounts-service")]),
            source,
        ));
        let response = build_router(gateway)
            .oneshot(
                http::Request::builder()
                    .uri("/api/v1/accounts/42?expand=cards")
                    .header(CORRELATION_HEADER, "corr-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CORRELATION_HEADER).unwrap(), "corr-1");
        let json = body_json(response).await;
        assert_eq!(json["path"], "/api/v1/accounts/42?expand=cards");
        assert_eq!(json["correlation"], "corr-1");
    }

    #[tokio::test]
    async fn post_body_and_method_reach_backend_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let port = serve(Router::new().fallback(
            move |method: Method, headers: HeaderMap, body: String| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let correlation = headers
                        .get(CORRELATION_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    Json(json!({
                        "method": method.as_str(),
                        "body": body,
                        "correlation": correlation,
                    }))
                }
            },
        ))
        .await;
        let source = Arc::new(StaticSource::default());
        source.add("accounts-service", "acc-1", port);

        let gateway = Arc::new(Gateway::new(
            &config(&[("/api/v1/accounts/**", "accounts-service")]),
            source,
        ));
        let response = build_router(gateway)
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/api/v1/accounts")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"n":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let echoed_id = response
            .headers()
            .get(CORRELATION_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let json = body_json(response).await;
        assert_eq!(json["method"], "POST");
        assert_eq!(json["body"], r#"{"n":1}"#);
        assert_eq!(json["correlation"], echoed_id.as_str());
        assert!(!echoed_id.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn strip_prefix_rewrites_upstream_path() {
        let port = serve(echo_backend("a")).await;
        let source = Arc::new(StaticSource::default());
        source.add("accounts-service", "acc-1", port);

        let mut cfg = config(&[("/accounts-api/**", "accounts-service")]);
        cfg.routes[0].strip_prefix = 1;
        let gateway = Arc::new(Gateway::new(&cfg, source));

        let response = build_router(gateway)
            .oneshot(get_request("/accounts-api/api/fetch"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["path"], "/api/fetch");
    }

    #[tokio::test]
    async fn unmatched_path_is_404_not_fallback() {
        let gateway = Arc::new(Gateway::new(
            &config(&[("/api/**", "svc")]),
            Arc::new(StaticSource::default()),
        ));
        let response = build_router(gateway)
            .oneshot(get_request("/nowhere"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(FALLBACK_HEADER).is_none());
    }

    #[tokio::test]
    async fn no_instance_falls_back() {
        let gateway = Arc::new(Gateway::new(
            &config(&[("/api/**", "svc")]),
            Arc::new(StaticSource::default()),
        ));
        let response = build_router(gateway)
            .oneshot(get_request("/api/x"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(FALLBACK_HEADER).unwrap(), "no_instance");
    }

    #[tokio::test]
    async fn timeout_is_retried_on_another_instance() {
        let slow = serve(slow_backend()).await;
        let fast = serve(echo_backend("fast")).await;
        let source = Arc::new(StaticSource::default());
        source.add("svc", "slow-1", slow);
        source.add("svc", "fast-1", fast);

        let gateway = Gateway::new(&config(&[("/api/**", "svc")]), source);
        // Round-robin starts at the first listed instance.
        let response = gateway.handle(get_request("/api/x")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["backend"], "fast");
        let snapshot = gateway.breakers().get("svc").snapshot();
        assert_eq!(snapshot.window_len, 2);
        assert_eq!(snapshot.failures, 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_fall_back() {
        let a = serve(slow_backend()).await;
        let b = serve(slow_backend()).await;
        let source = Arc::new(StaticSource::default());
        source.add("svc", "slow-a", a);
        source.add("svc", "slow-b", b);

        let gateway = Gateway::new(&config(&[("/api/**", "svc")]), source);
        let response = gateway.handle(get_request("/api/x")).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(FALLBACK_HEADER).unwrap(), "attempts_exhausted");
    }

    #[tokio::test]
    async fn open_circuit_never_contacts_backend() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let port = serve(Router::new().fallback(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }))
        .await;
        let source = Arc::new(StaticSource::default());
        source.add("svc", "only", port);

        let mut cfg = config(&[("/api/**", "svc")]);
        cfg.gateway.max_retries = 0;
        cfg.circuit_breaker.defaults = BreakerParams {
            window_size: 2,
            failure_status_codes: vec![500],
            wait_duration: Duration::from_secs(60),
            ..BreakerParams::default()
        };
        let gateway = Gateway::new(&cfg, source);

        for _ in 0..2 {
            let response = gateway.handle(get_request("/api/x")).await;
            assert_eq!(response.headers().get(FALLBACK_HEADER).unwrap(), "attempts_exhausted");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let response = gateway.handle(get_request("/api/x")).await;
        assert_eq!(response.headers().get(FALLBACK_HEADER).unwrap(), "circuit_open");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn open_circuit_lets_request_through_after_wait() {
        let hits = Arc::new(AtomicUsize::new(0));
        let healthy = Arc::new(AtomicBool::new(false));
        let (counter, flag) = (Arc::clone(&hits), Arc::clone(&healthy));
        let port = serve(Router::new().fallback(move || {
            let (counter, flag) = (Arc::clone(&counter), Arc::clone(&flag));
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if flag.load(Ordering::SeqCst) {
                    StatusCode::OK
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
        }))
        .await;
        let source = Arc::new(StaticSource::default());
        source.add("svc", "only", port);

        let mut cfg = config(&[("/api/**", "svc")]);
        cfg.gateway.max_retries = 0;
        cfg.circuit_breaker.defaults = BreakerParams {
            window_size: 2,
            failure_status_codes: vec![500],
            wait_duration: Duration::from_secs(10),
            ..BreakerParams::default()
        };
        let clock = ManualClock::new();
        let gateway = Gateway::with_clock(&cfg, source, Arc::new(clock.clone()));

        for _ in 0..2 {
            gateway.handle(get_request("/api/x")).await;
        }
        let response = gateway.handle(get_request("/api/x")).await;
        assert_eq!(response.headers().get(FALLBACK_HEADER).unwrap(), "circuit_open");
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        healthy.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_secs(10));

        let response = gateway.handle(get_request("/api/x")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(gateway.breakers().get("svc").status(), CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn backend_errors_pass_through_when_not_failure_codes() {
        let port = serve(Router::new().fallback(|| async {
            (StatusCode::INTERNAL_SERVER_ERROR, "boom")
        }))
        .await;
        let source = Arc::new(StaticSource::default());
        source.add("svc", "only", port);

        let gateway = Gateway::new(&config(&[("/api/**", "svc")]), source);
        let response = gateway.handle(get_request("/api/x")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(FALLBACK_HEADER).is_none());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let source = Arc::new(StaticSource::default());
        source.add("svc", "only", 1);
        let mut cfg = config(&[("/api/**", "svc")]);
        cfg.gateway.max_body_bytes = 4;
        let gateway = Gateway::new(&cfg, source);

        let response = gateway
            .handle(
                http::Request::builder()
                    .method("POST")
                    .uri("/api/x")
                    .body(Body::from("too large"))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn management_endpoints_describe_gateway() {
        let gateway = Arc::new(Gateway::new(
            &config(&[("/api/**", "svc"), ("/api/v1/**", "v1")]),
            Arc::new(StaticSource::default()),
        ));
        gateway.breakers().get("svc");
        let app = build_router(gateway);

        let routes = body_json(app.clone().oneshot(get_request("/gateway/routes")).await.unwrap()).await;
        assert_eq!(routes[0]["service"], "v1");
        assert_eq!(routes[1]["pattern"], "/api/**");

        let circuits =
            body_json(app.clone().oneshot(get_request("/gateway/circuits")).await.unwrap()).await;
        assert_eq!(circuits[0]["service"], "svc");
        assert_eq!(circuits[0]["status"], "closed");

        let health = body_json(app.oneshot(get_request("/gateway/health")).await.unwrap()).await;
        assert_eq!(health["status"], "up");
        assert_eq!(health["routes"], 2);
    }

    #[tokio::test]
    async fn configured_cors_answers_preflight_without_backend() {
        let mut cfg = config(&[("/api/**", "svc")]);
        cfg.gateway.cors = Some(CorsSettings::default());
        let gateway = Arc::new(Gateway::new(&cfg, Arc::new(StaticSource::default())));

        let response = build_router(gateway)
            .oneshot(
                http::Request::builder()
                    .method("OPTIONS")
                    .uri("/api/x")
                    .header("origin", "https://app.example.com")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "*");
        assert!(response.headers().get(FALLBACK_HEADER).is_none());
    }

    #[test]
    fn select_instance_reports_empty_service() {
        let gateway = Gateway::new(&config(&[]), Arc::new(StaticSource::default()));
        assert_eq!(
            gateway.select_instance("ghost"),
            Err(ProxyError::NoInstanceAvailable("ghost".to_string()))
        );
    }
}
