//! Cross-origin headers owned by the gateway
//!
//! Backends never decide CORS policy: whatever `Access-Control-*` headers
//! they send are removed, and the gateway's own set is added to every
//! response it produces, errors included.

use crate::config::{ConfigError, CorsConfig};
use crate::error::full_body;
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
};
use hyper::{Response, StatusCode};

const ACCESS_CONTROL_PREFIX: &str = "access-control-";

#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allow_origin: HeaderValue,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
}

impl CorsPolicy {
    pub fn from_config(config: &CorsConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            allow_origin: header_value("cors.allow_origin", &config.allow_origin)?,
            allow_methods: header_value("cors.allow_methods", &config.allow_methods)?,
            allow_headers: header_value("cors.allow_headers", &config.allow_headers)?,
        })
    }

    /// Set the gateway's CORS headers, replacing any present
    pub fn apply<B>(&self, response: &mut Response<B>) {
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
    }

    /// Answer to a preflight request: 200, empty body, CORS headers
    pub fn preflight_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let mut response = Response::new(full_body(Bytes::new()));
        *response.status_mut() = StatusCode::OK;
        self.apply(&mut response);
        response
    }
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            allow_origin: HeaderValue::from_static("*"),
            allow_methods: HeaderValue::from_static("GET, HEAD, OPTIONS"),
            allow_headers: HeaderValue::from_static("Authorization, Content-Type, X-Requested-With"),
        }
    }
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

/// Remove every `Access-Control-*` header a backend set
pub fn strip_backend_cors(headers: &mut HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(ACCESS_CONTROL_PREFIX))
        .cloned()
        .collect();

    for name in names {
        headers.remove(&name);
    }
}
