//! Health endpoint for load balancers and orchestrators

use crate::backend_pool::BackendPool;
use crate::error::full_body;
use crate::upstream::GatewayBody;
use hyper::{Response, StatusCode};
use serde::Serialize;

const NO_BACKENDS: &str = "No tile servers available";

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend_count: Option<usize>,
}

/// 200 with the backend count when the pool is ready, 503 otherwise
pub fn health_response(pool: &BackendPool) -> Response<GatewayBody> {
    let (status, body) = if pool.is_ready() {
        (
            StatusCode::OK,
            HealthStatus {
                status: "OK",
                backend_count: Some(pool.backend_count()),
            },
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            HealthStatus {
                status: NO_BACKENDS,
                backend_count: None,
            },
        )
    };

    let json = serde_json::to_string(&body).unwrap_or_else(|_| format!(r#"{{"status":"{}"}}"#, body.status));

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full_body(json))
        .expect("valid response with StatusCode enum and static headers")
}
