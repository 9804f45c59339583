//! Rewrites an authenticated tile request so it targets a backend
//!
//! The director never fails a request. When the pool has no endpoints it
//! logs and leaves the target without a backend authority, so the upstream
//! dial fails and the client sees a gateway error.

use crate::auth::IdentityClaims;
use crate::backend_pool::BackendPool;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::http::uri::PathAndQuery;
use hyper::{Request, Uri, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Header name for the client's address
const X_REAL_IP: &str = "x-real-ip";

/// Headers meaningful only for a single transport hop
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

/// True when `path` is the route prefix itself or below it
pub fn matches_route(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Remove the route prefix from a path and query: `/tiles/a/b?x` becomes
/// `/a/b?x` and `/tiles` becomes `/`. Returns `None` when the path is not
/// under the prefix.
pub fn strip_route_prefix(path_and_query: &str, prefix: &str) -> Option<String> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    if !matches_route(path, prefix) {
        return None;
    }

    let rest = &path[prefix.len()..];
    let path = if rest.is_empty() { "/" } else { rest };

    Some(match query {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    })
}

pub struct Director {
    pool: Arc<BackendPool>,
    route_prefix: String,
    forwarded_proto: HeaderValue,
}

impl Director {
    pub fn new(pool: Arc<BackendPool>, route_prefix: impl Into<String>, forwarded_proto: HeaderValue) -> Self {
        Self {
            pool,
            route_prefix: route_prefix.into(),
            forwarded_proto,
        }
    }

    /// Point the request at the next backend and set the forwarding headers
    pub fn direct<B>(&self, req: &mut Request<B>, client_addr: SocketAddr) {
        let forwarded_host = req
            .headers()
            .get(HOST)
            .cloned()
            .or_else(|| {
                req.uri()
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        let original = req
            .uri()
            .path_and_query()
            .map(PathAndQuery::as_str)
            .unwrap_or("/");
        let stripped = strip_route_prefix(original, &self.route_prefix)
            .unwrap_or_else(|| original.to_string());
        let path_and_query = match PathAndQuery::try_from(stripped.as_str()) {
            Ok(pq) => pq,
            Err(_) => PathAndQuery::from_static("/"),
        };

        let subject = req
            .extensions()
            .get::<IdentityClaims>()
            .map(|claims| claims.subject.clone());

        match self.pool.next_endpoint() {
            Ok(endpoint) => {
                let target = Uri::builder()
                    .scheme(endpoint.scheme().clone())
                    .authority(endpoint.authority().clone())
                    .path_and_query(path_and_query)
                    .build();
                match target {
                    Ok(uri) => *req.uri_mut() = uri,
                    Err(e) => warn!(backend = %endpoint, error = %e, "Failed to build backend URI"),
                }
                if let Ok(host) = HeaderValue::from_str(endpoint.authority().as_str()) {
                    req.headers_mut().insert(HOST, host);
                }
                debug!(backend = %endpoint, path = %req.uri().path(), subject = ?subject, "Directing request");
            }
            Err(e) => {
                // Origin-form only; no authority to dial
                warn!(error = %e, subject = ?subject, "No backend available for request");
                *req.uri_mut() = Uri::from(path_and_query);
            }
        }

        *req.version_mut() = Version::HTTP_11;

        let headers = req.headers_mut();
        remove_hop_by_hop(headers);

        // Overwrite client-supplied forwarding headers; this is the first trusted hop
        if let Some(host) = forwarded_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, self.forwarded_proto.clone());
        if let Ok(ip) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_REAL_IP, ip.clone());
            headers.insert(X_FORWARDED_FOR, ip);
        }
    }
}

/// Drop hop-by-hop headers, including any named by `Connection`
fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
