//! Outbound HTTP forwarding.
//!
//! One pooled hyper client is shared by every request. Each exchange,
//! including reading the backend's full response body, runs under a
//! single hard deadline.

use std::net::IpAddr;
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full, Limited};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use relaygrid_core::ServiceInstance;

use crate::error::{ProxyError, ProxyResult};
use crate::filters::CORRELATION_HEADER;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A buffered request ready to be sent to any instance, possibly more
/// than once.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn new(method: Method, path_and_query: String, mut headers: HeaderMap, body: Bytes) -> Self {
        strip_hop_by_hop(&mut headers);
        // Recomputed by the client for the new target and body.
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        Self {
            method,
            path_and_query,
            headers,
            body,
        }
    }

    /// Record where the request came from.
    pub fn set_forwarded(&mut self, client: Option<IpAddr>, original_host: Option<HeaderValue>) {
        if let Some(ip) = client {
            let value = match self
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(prior) => format!("{prior}, {ip}"),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                self.headers.insert("x-forwarded-for", value);
            }
        }
        if let Some(host) = original_host {
            self.headers.insert("x-forwarded-host", host);
        }
        self.headers
            .insert("x-forwarded-proto", HeaderValue::from_static("http"));
    }

    pub fn set_correlation_id(&mut self, id: &str) {
        if let Ok(value) = HeaderValue::from_str(id) {
            self.headers.insert(CORRELATION_HEADER, value);
        }
    }
}

/// Sends requests to backend instances.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
    max_response_bytes: usize,
}

/// Default cap on a buffered backend response body.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

impl Forwarder {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            client,
            timeout,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    /// Cap on the backend response body. Larger replies fail the attempt.
    pub fn with_response_limit(mut self, max_response_bytes: usize) -> Self {
        self.max_response_bytes = max_response_bytes;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `request` to `instance` and buffer the reply.
    ///
    /// Any HTTP status is a successful exchange here; deciding whether a
    /// status counts as a failure is up to the caller.
    pub async fn forward(
        &self,
        request: &OutboundRequest,
        instance: &ServiceInstance,
    ) -> ProxyResult<Response> {
        let endpoint = instance.endpoint();
        let uri: Uri = format!("http://{endpoint}{}", request.path_and_query)
            .parse()
            .map_err(|e| ProxyError::InvalidRequest(format!("bad upstream uri: {e}")))?;

        let mut builder = Request::builder().method(request.method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers.clone());
        }
        let outbound = builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

        let exchange = async {
            let response = self.client.request(outbound).await.map_err(|e| {
                ProxyError::ForwardConnectionFailure {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                }
            })?;
            let (parts, body) = response.into_parts();
            let bytes = Limited::new(body, self.max_response_bytes)
                .collect()
                .await
                .map_err(|e| ProxyError::ForwardConnectionFailure {
                    endpoint: endpoint.clone(),
                    reason: format!("reading response body: {e}"),
                })?
                .to_bytes();
            Ok::<_, ProxyError>((parts, bytes))
        };

        let (mut parts, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ProxyError::ForwardTimeout {
                endpoint: endpoint.clone(),
                timeout: self.timeout,
            })??;

        debug!(
            %endpoint,
            status = parts.status.as_u16(),
            bytes = bytes.len(),
            "backend responded"
        );
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::from(bytes)))
    }
}

/// Remove connection-scoped headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
