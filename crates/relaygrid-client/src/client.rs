//! HTTP client for the registry API.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use tracing::debug;

use relaygrid_api::{ApiResponse, RegisterRequest};
use relaygrid_core::ServiceInstance;
use relaygrid_registry::ServiceSummary;

use crate::error::{ClientError, ClientResult};

const API_PREFIX: &str = "/registry/v1";

/// Talks to one registry over HTTP/1.1.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base: String,
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl RegistryClient {
    /// `base_url` is the registry root, e.g. `http://127.0.0.1:8070`.
    pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        let base = base_url.trim_end_matches('/').to_string();
        let uri: Uri = base
            .parse()
            .map_err(|_| ClientError::InvalidUrl(base_url.to_string()))?;
        if uri.scheme_str() != Some("http") || uri.host().is_none() {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self {
            base,
            client,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub async fn register(
        &self,
        service: &str,
        instance_id: &str,
        host: &str,
        port: u16,
    ) -> ClientResult<ServiceInstance> {
        let body = RegisterRequest {
            instance_id: instance_id.to_string(),
            host: host.to_string(),
            port,
        };
        let body = serde_json::to_vec(&body).map_err(|e| ClientError::Decode(e.to_string()))?;
        let (status, envelope) = self
            .send::<ServiceInstance>(
                Method::POST,
                &format!("/services/{service}/instances"),
                Some(body),
            )
            .await?;
        require_data(status, envelope)
    }

    /// Renew a lease. A 404 becomes `ClientError::NotFound`.
    pub async fn heartbeat(&self, service: &str, instance_id: &str) -> ClientResult<()> {
        let (status, envelope) = self
            .send::<serde_json::Value>(
                Method::PUT,
                &format!("/services/{service}/instances/{instance_id}/heartbeat"),
                None,
            )
            .await?;
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound {
                service: service.to_string(),
                instance_id: instance_id.to_string(),
            }),
            s => Err(status_error(s, envelope)),
        }
    }

    /// Returns `false` if the registry did not know the instance.
    pub async fn deregister(&self, service: &str, instance_id: &str) -> ClientResult<bool> {
        let (status, envelope) = self
            .send::<bool>(
                Method::DELETE,
                &format!("/services/{service}/instances/{instance_id}"),
                None,
            )
            .await?;
        require_data(status, envelope)
    }

    pub async fn list_instances(&self, service: &str) -> ClientResult<Vec<ServiceInstance>> {
        let (status, envelope) = self
            .send(Method::GET, &format!("/services/{service}/instances"), None)
            .await?;
        require_data(status, envelope)
    }

    pub async fn list_services(&self) -> ClientResult<Vec<ServiceSummary>> {
        let (status, envelope) = self.send(Method::GET, "/services", None).await?;
        require_data(status, envelope)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ClientResult<(StatusCode, Option<ApiResponse<T>>)> {
        let uri = format!("{}{API_PREFIX}{path}", self.base);
        let mut builder = Request::builder().method(method.clone()).uri(&uri);
        if body.is_some() {
            builder = builder.header(http::header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|_| ClientError::InvalidUrl(uri.clone()))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?
                .to_bytes();
            Ok::<_, ClientError>((status, bytes))
        };
        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;

        debug!(%method, %uri, status = status.as_u16(), "registry call");
        // Error bodies from the framework itself are not enveloped.
        let envelope = serde_json::from_slice::<ApiResponse<T>>(&bytes).ok();
        Ok((status, envelope))
    }
}

fn require_data<T>(status: StatusCode, envelope: Option<ApiResponse<T>>) -> ClientResult<T> {
    if !status.is_success() {
        return Err(status_error(status, envelope));
    }
    envelope
        .and_then(|e| e.data)
        .ok_or_else(|| ClientError::Decode(format!("{status} response without data")))
}

fn status_error<T>(status: StatusCode, envelope: Option<ApiResponse<T>>) -> ClientError {
    ClientError::Status {
        status: status.as_u16(),
        message: envelope
            .and_then(|e| e.error)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string()),
    }
}
