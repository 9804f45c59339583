//! Gateway request pipeline and HTTP server
//!
//! Every request passes through the same stages: preflight handling,
//! routing, token verification, the director, the upstream call and the
//! response sanitizer. CORS headers and the request ID are added to every
//! response on the way out.

use crate::auth::{AuthError, TokenVerifier};
use crate::backend_pool::BackendPool;
use crate::config::{Config, ConfigError};
use crate::cors::{strip_backend_cors, CorsPolicy};
use crate::director::{matches_route, Director, X_REQUEST_ID};
use crate::error::{json_error_response, GatewayErrorCode};
use crate::health::health_response;
use crate::upstream::{GatewayBody, UpstreamClient, UpstreamConfig, UpstreamError};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderValue, ALLOW};
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const HEALTH_PATH: &str = "/health";

/// The composed request pipeline
pub struct Gateway {
    pool: Arc<BackendPool>,
    verifier: Arc<TokenVerifier>,
    director: Director,
    upstream: UpstreamClient,
    cors: CorsPolicy,
    route_prefix: String,
}

impl Gateway {
    pub fn new(
        config: &Config,
        pool: Arc<BackendPool>,
        verifier: Arc<TokenVerifier>,
    ) -> Result<Self, ConfigError> {
        let forwarded_proto =
            HeaderValue::from_str(&config.server.external_scheme).map_err(|e| ConfigError::Invalid {
                name: "server.external_scheme",
                reason: e.to_string(),
            })?;

        Ok(Self {
            director: Director::new(
                Arc::clone(&pool),
                config.server.route_prefix.clone(),
                forwarded_proto,
            ),
            upstream: UpstreamClient::new(UpstreamConfig::from(&config.server)),
            cors: CorsPolicy::from_config(&config.cors)?,
            route_prefix: config.server.route_prefix.clone(),
            pool,
            verifier,
        })
    }

    /// Handle one inbound request. Never fails: every outcome is a response.
    pub async fn handle<B>(&self, mut req: Request<B>, client_addr: SocketAddr) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let request_id_header = HeaderValue::from_str(&request_id).ok();
        if let Some(value) = &request_id_header {
            req.headers_mut().insert(X_REQUEST_ID, value.clone());
        }

        debug!(method = %req.method(), path = %req.uri().path(), request_id = %request_id, "Incoming request");

        let mut response = self.route(req, client_addr).await;

        self.cors.apply(&mut response);
        if let Some(value) = request_id_header {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        response
    }

    async fn route<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        // Preflight is answered for any path, before authentication
        if req.method() == Method::OPTIONS {
            return self.cors.preflight_response();
        }

        let readable = matches!(*req.method(), Method::GET | Method::HEAD);
        let path = req.uri().path();

        if path == HEALTH_PATH {
            return if readable {
                health_response(&self.pool)
            } else {
                method_not_allowed()
            };
        }

        if matches_route(path, &self.route_prefix) {
            return if readable {
                self.proxy(req, client_addr).await
            } else {
                method_not_allowed()
            };
        }

        json_error_response(GatewayErrorCode::NotFound, "Not found")
    }

    async fn proxy<B>(&self, mut req: Request<B>, client_addr: SocketAddr) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let claims = match self.verifier.authenticate(&req).await {
            Ok(claims) => claims,
            Err(e) => {
                match &e {
                    AuthError::MissingToken => debug!(client = %client_addr, "Request without token"),
                    AuthError::ClaimsDecode(_) => error!(client = %client_addr, error = %e, "Rejected request"),
                    _ => warn!(client = %client_addr, error = %e, "Rejected request"),
                }
                return json_error_response(e.code(), e.public_message());
            }
        };

        debug!(subject = %claims.subject, username = %claims.preferred_username, "Authenticated request");
        req.extensions_mut().insert(claims);

        self.director.direct(&mut req, client_addr);
        let target = req.uri().clone();

        match self.upstream.send(req.map(|body| body.boxed())).await {
            Ok(mut response) => {
                strip_backend_cors(response.headers_mut());
                response
            }
            Err(e @ UpstreamError::Timeout(_)) => {
                warn!(target = %target, error = %e, "Backend request timed out");
                json_error_response(e.code(), "Tile server did not respond in time")
            }
            Err(e) => {
                // Log detailed error internally, return generic message externally
                error!(target = %target, error = %e, "Failed to forward request");
                json_error_response(e.code(), "Failed to connect to tile server")
            }
        }
    }
}

fn method_not_allowed() -> Response<GatewayBody> {
    let mut response = json_error_response(GatewayErrorCode::MethodNotAllowed, "Method not allowed");
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static("GET, HEAD, OPTIONS"));
    response
}

/// Accept loop serving a [`Gateway`] over HTTP/1.1 and h2c
pub struct GatewayServer {
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
    drain_timeout: Duration,
}

impl GatewayServer {
    pub async fn bind(
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            gateway,
            shutdown_rx,
            drain_timeout: Duration::from_secs(5),
        })
    }

    /// How long open connections may finish after shutdown
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let conn_shutdown = self.shutdown_rx.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, gateway, conn_shutdown).await {
                                    debug!(addr = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    info!("Gateway shutting down");
                    break;
                }
            }
        }

        drop(self.listener);

        if !connections.is_empty() {
            info!(
                connections = connections.len(),
                drain_timeout_secs = self.drain_timeout.as_secs(),
                "Draining open connections"
            );
        }
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "Drain timeout elapsed, closing connections");
            connections.abort_all();
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, Infallible>(gateway.handle(req, addr).await) }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http2().max_concurrent_streams(250);
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                return result.map_err(|e| anyhow::anyhow!("Connection error: {}", e));
            }
            _ = shutdown_rx.wait_for(|stop| *stop), if !draining => {
                // Finish in-flight requests, then close
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}
