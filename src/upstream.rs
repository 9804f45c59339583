//! Pooled HTTP client for tile backends
//!
//! Connections to backends are kept alive and reused across requests.
//! Every request is bounded by the configured timeout.

use crate::config::ServerConfig;
use crate::error::GatewayErrorCode;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to reach backend: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),

    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
}

impl UpstreamError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            UpstreamError::Connect(_) => GatewayErrorCode::ConnectionFailed,
            UpstreamError::Timeout(_) => GatewayErrorCode::RequestTimeout,
        }
    }
}

/// Configuration for the upstream client
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Maximum idle connections per backend
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Time allowed for a backend to produce response headers
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&ServerConfig> for UpstreamConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: server.pool_idle_timeout(),
            request_timeout: server.request_timeout(),
        }
    }
}

pub struct UpstreamClient {
    client: Client<HttpConnector, GatewayBody>,
    request_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Upstream client initialized"
        );

        Self {
            client,
            request_timeout: config.request_timeout,
        }
    }

    /// Send an already-directed request to its backend
    pub async fn send(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, UpstreamError> {
        let response = tokio::time::timeout(self.request_timeout, self.client.request(req))
            .await
            .map_err(|_| UpstreamError::Timeout(self.request_timeout))??;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
