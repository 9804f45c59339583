//! tile-gateway - An authenticating reverse proxy for tile servers
//!
//! This library provides a gateway that:
//! - Discovers healthy tile server instances from AWS Cloud Map
//! - Load-balances requests across them round-robin
//! - Verifies bearer tokens against the identity provider's published keys
//! - Rewrites forwarding metadata and owns the CORS policy of every response
//! - Reports readiness on a health endpoint

pub mod auth;
pub mod aws;
pub mod backend_pool;
pub mod config;
pub mod cors;
pub mod director;
pub mod error;
pub mod health;
pub mod proxy;
pub mod registry;
pub mod upstream;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
