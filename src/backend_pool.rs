//! Backend pool for distributing requests across tile server instances
//!
//! The pool owns the current list of healthy backend addresses. A background
//! task refreshes the list from the service registry on a fixed period, and
//! request handlers pick addresses from it in round-robin order.
//!
//! The list is replaced wholesale under the write lock, so readers always see
//! either the previous or the next complete list. A failed or empty lookup
//! never clears a populated list.

use crate::registry::{RegistryInstance, ServiceRegistry};
use hyper::http::uri::{Authority, Scheme};
use hyper::Uri;
use parking_lot::RwLock;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("no healthy endpoints available")]
    NoEndpoints,
}

/// Base address of one backend: scheme and authority, no path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    authority: Authority,
}

impl Endpoint {
    pub fn new(scheme: &str, authority: &str) -> Result<Self, hyper::http::uri::InvalidUri> {
        Ok(Self {
            scheme: Scheme::try_from(scheme)?,
            authority: Authority::from_str(authority)?,
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }
}

impl FromStr for Endpoint {
    type Err = hyper::http::uri::InvalidUri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = Uri::from_str(s)?;
        match (uri.scheme_str(), uri.authority()) {
            (Some(scheme), Some(authority)) => Endpoint::new(scheme, authority.as_str()),
            // Re-parse as an authority so the caller gets a parse error
            _ => Endpoint::new("http", ""),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// Result of a single refresh cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The list was replaced with this many endpoints
    Updated(usize),
    /// The registry answered with no usable instances; the list was kept
    Empty,
    /// The registry lookup failed; the list was kept
    Failed,
}

/// Registry-backed pool of backend endpoints with round-robin selection
pub struct BackendPool {
    registry: Arc<dyn ServiceRegistry>,
    /// Scheme used to reach backends
    scheme: String,
    /// Current endpoints, replaced wholesale on refresh
    endpoints: RwLock<Vec<Endpoint>>,
    /// Current index for round-robin
    round_robin_index: AtomicUsize,
}

impl BackendPool {
    pub fn new(registry: Arc<dyn ServiceRegistry>, scheme: impl Into<String>) -> Self {
        Self {
            registry,
            scheme: scheme.into(),
            endpoints: RwLock::new(Vec::new()),
            round_robin_index: AtomicUsize::new(0),
        }
    }

    /// Query the registry and publish the new endpoint list if it is non-empty
    pub async fn refresh(&self) -> RefreshOutcome {
        // No lock is held while the registry call is in flight
        let instances = match self.registry.discover_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                error!(error = %e, retained = self.backend_count(), "Error discovering instances");
                return RefreshOutcome::Failed;
            }
        };

        let fresh: Vec<Endpoint> = instances
            .iter()
            .filter_map(|instance| self.endpoint_for(instance))
            .collect();

        if fresh.is_empty() {
            warn!(
                instances = instances.len(),
                retained = self.backend_count(),
                "Registry returned no usable instances, keeping current backends"
            );
            return RefreshOutcome::Empty;
        }

        let count = fresh.len();
        let changed = {
            let mut endpoints = self.endpoints.write();
            let changed = *endpoints != fresh;
            *endpoints = fresh;
            changed
        };

        if changed {
            info!(
                count,
                backends = ?self.endpoints().iter().map(ToString::to_string).collect::<Vec<_>>(),
                "Backend pool updated"
            );
        } else {
            debug!(count, "Backend pool unchanged");
        }

        RefreshOutcome::Updated(count)
    }

    fn endpoint_for(&self, instance: &RegistryInstance) -> Option<Endpoint> {
        let Some(ip) = instance.ip() else {
            warn!(instance_id = %instance.instance_id, "Instance has no IP attribute, skipping");
            return None;
        };

        let authority = match instance.port() {
            Some(port) => format!("{}:{}", ip, port),
            None => ip.to_string(),
        };

        match Endpoint::new(&self.scheme, &authority) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!(instance_id = %instance.instance_id, authority = %authority, error = %e, "Invalid instance address, skipping");
                None
            }
        }
    }

    /// Refresh once, then keep refreshing every `interval` on a background
    /// task until `shutdown_rx` reports `true`.
    ///
    /// The first refresh completes before this returns, so the pool is
    /// populated before traffic is served whenever the registry allows it.
    pub async fn start_polling(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        self.refresh().await;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_ms = interval.as_millis() as u64, "Backend pool polling started");

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                tokio::select! {
                    _ = ticker.tick() => {
                        self.refresh().await;
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Backend pool polling stopped");
        })
    }

    /// Get the next endpoint in round-robin order
    pub fn next_endpoint(&self) -> Result<Endpoint, PoolError> {
        let endpoints = self.endpoints.read();
        if endpoints.is_empty() {
            return Err(PoolError::NoEndpoints);
        }

        let idx = self.round_robin_index.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        Ok(endpoints[idx].clone())
    }

    /// True when at least one backend is known
    pub fn is_ready(&self) -> bool {
        !self.endpoints.read().is_empty()
    }

    pub fn backend_count(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Snapshot of the current endpoints
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().clone()
    }
}
