use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors raised while building the startup configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("missing required settings: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
}

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Where backend instances are discovered
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Bearer token verification
    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listening port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Enable debug logging
    #[serde(default)]
    pub verbose: bool,

    /// Path prefix of the proxied tile routes, stripped before forwarding
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,

    /// Scheme clients use to reach the gateway, sent as X-Forwarded-Proto
    #[serde(default = "default_external_scheme")]
    pub external_scheme: String,

    /// Maximum time to wait for a backend response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// How long in-flight connections may drain after shutdown is signalled
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            verbose: false,
            route_prefix: default_route_prefix(),
            external_scheme: default_external_scheme(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Source of backend instances
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistryMode {
    /// AWS Cloud Map service discovery (default)
    #[default]
    #[serde(alias = "cloudmap")]
    CloudMap,
    /// Fixed list of backends, for local development
    Static,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default)]
    pub mode: RegistryMode,

    /// Cloud Map namespace, also used to address the identity provider
    pub namespace: Option<String>,

    /// Cloud Map service name of the tile servers
    pub service_name: Option<String>,

    /// AWS region of the Cloud Map namespace
    pub region: Option<String>,

    /// Override for the Cloud Map data-plane endpoint
    pub endpoint: Option<String>,

    /// Scheme used to reach backends (default: http)
    #[serde(default = "default_backend_scheme")]
    pub backend_scheme: String,

    /// Seconds between registry refreshes (default: 10)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum instances returned per lookup (default: 100)
    #[serde(default = "default_max_results")]
    pub max_results: u32,

    /// Timeout for a single registry lookup in seconds
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,

    /// `host:port` backends served in static mode
    #[serde(default)]
    pub static_backends: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mode: RegistryMode::default(),
            namespace: None,
            service_name: None,
            region: None,
            endpoint: None,
            backend_scheme: default_backend_scheme(),
            poll_interval_secs: default_poll_interval(),
            max_results: default_max_results(),
            timeout_secs: default_registry_timeout(),
            static_backends: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Cloud Map data-plane endpoint, derived from the region unless overridden
    pub fn endpoint_url(&self) -> Option<String> {
        self.endpoint.clone().or_else(|| {
            self.region
                .as_ref()
                .map(|region| format!("https://data-servicediscovery.{}.amazonaws.com", region))
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Hostname of the identity provider inside the namespace
    pub idp_host: Option<String>,

    /// Port of the identity provider
    pub idp_port: Option<u16>,

    /// Explicit key-set URL, overrides the one derived from host, namespace and port
    pub jwks_url: Option<String>,

    /// Expected `iss` claim
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Client identifiers accepted in the `aud` claim
    #[serde(default)]
    pub allowed_client_ids: Vec<String>,

    /// Accepted signing algorithms (default: RS256)
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<Algorithm>,

    /// Query parameter carrying the token for clients that cannot set headers
    #[serde(default = "default_token_query_param")]
    pub token_query_param: String,

    /// Timeout for key-set fetches in seconds
    #[serde(default = "default_jwks_timeout")]
    pub jwks_timeout_secs: u64,

    /// Minimum seconds between key-set refetches triggered by unknown key ids
    #[serde(default = "default_jwks_refresh_min_interval")]
    pub jwks_refresh_min_interval_secs: u64,

    /// Clock skew tolerated on `exp` and `nbf`
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            idp_host: None,
            idp_port: None,
            jwks_url: None,
            issuer: default_issuer(),
            allowed_client_ids: Vec::new(),
            algorithms: default_algorithms(),
            token_query_param: default_token_query_param(),
            jwks_timeout_secs: default_jwks_timeout(),
            jwks_refresh_min_interval_secs: default_jwks_refresh_min_interval(),
            leeway_secs: default_leeway(),
        }
    }
}

impl AuthConfig {
    pub fn jwks_timeout(&self) -> Duration {
        Duration::from_secs(self.jwks_timeout_secs)
    }

    pub fn jwks_refresh_min_interval(&self) -> Duration {
        Duration::from_secs(self.jwks_refresh_min_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    #[serde(default = "default_allow_origin")]
    pub allow_origin: String,

    #[serde(default = "default_allow_methods")]
    pub allow_methods: String,

    #[serde(default = "default_allow_headers")]
    pub allow_headers: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: default_allow_origin(),
            allow_methods: default_allow_methods(),
            allow_headers: default_allow_headers(),
        }
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_route_prefix() -> String {
    "/tiles".to_string()
}

fn default_external_scheme() -> String {
    "https".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_backend_scheme() -> String {
    "http".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_max_results() -> u32 {
    100
}

fn default_registry_timeout() -> u64 {
    5
}

fn default_issuer() -> String {
    "https://auth.civillabs.app".to_string()
}

fn default_algorithms() -> Vec<Algorithm> {
    vec![Algorithm::RS256]
}

fn default_token_query_param() -> String {
    "token".to_string()
}

fn default_jwks_timeout() -> u64 {
    5
}

fn default_jwks_refresh_min_interval() -> u64 {
    5
}

fn default_leeway() -> u64 {
    60
}

fn default_allow_origin() -> String {
    "*".to_string()
}

fn default_allow_methods() -> String {
    "GET, HEAD, OPTIONS".to_string()
}

fn default_allow_headers() -> String {
    "Authorization, Content-Type, X-Requested-With".to_string()
}

impl Config {
    /// Build the configuration from an optional TOML file, environment
    /// overrides resolved through `lookup`, and validation.
    pub fn load<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&content)?
            }
            None => Config::default(),
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay the deployment environment variables on top of file settings
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(port) = get("PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                reason: format!("'{}' is not a port number", port),
            })?;
        }
        if let Some(verbose) = get("CIVIL_VERBOSE") {
            self.server.verbose = parse_flag(&verbose).ok_or_else(|| ConfigError::Invalid {
                name: "CIVIL_VERBOSE",
                reason: format!("'{}' is not a boolean", verbose),
            })?;
        }
        if let Some(namespace) = get("CIVIL_CLOUD_MAP_NAMESPACE") {
            self.registry.namespace = Some(namespace);
        }
        if let Some(service) = get("CIVIL_TILE_SERVER_LOCAL_HOSTNAME") {
            self.registry.service_name = Some(service);
        }
        if let Some(endpoint) = get("CIVIL_CLOUD_MAP_ENDPOINT") {
            self.registry.endpoint = Some(endpoint);
        }
        if let Some(region) = get("AWS_REGION").or_else(|| get("AWS_DEFAULT_REGION")) {
            self.registry.region = Some(region);
        }
        if let Some(backends) = get("CIVIL_STATIC_BACKENDS") {
            self.registry.mode = RegistryMode::Static;
            self.registry.static_backends = split_list(&backends);
        }
        if let Some(host) = get("CIVIL_IDP_LOCAL_HOSTNAME") {
            self.auth.idp_host = Some(host);
        }
        if let Some(port) = get("CIVIL_IDP_LOCAL_PORT") {
            self.auth.idp_port = Some(port.parse().map_err(|_| ConfigError::Invalid {
                name: "CIVIL_IDP_LOCAL_PORT",
                reason: format!("'{}' is not a port number", port),
            })?);
        }
        if let Some(issuer) = get("CIVIL_IDP_ISSUER") {
            self.auth.issuer = issuer;
        }
        if let Some(ids) = get("CIVIL_ALLOWED_CLIENT_IDS") {
            self.auth.allowed_client_ids = split_list(&ids);
        }

        Ok(())
    }

    /// Validate all configuration, reporting every missing setting at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();

        match self.registry.mode {
            RegistryMode::CloudMap => {
                if self.registry.namespace.is_none() {
                    missing.push("CIVIL_CLOUD_MAP_NAMESPACE");
                }
                if self.registry.service_name.is_none() {
                    missing.push("CIVIL_TILE_SERVER_LOCAL_HOSTNAME");
                }
                if self.registry.endpoint_url().is_none() {
                    missing.push("AWS_REGION");
                }
            }
            RegistryMode::Static => {
                if self.registry.static_backends.is_empty() {
                    missing.push("CIVIL_STATIC_BACKENDS");
                }
            }
        }

        if self.auth.jwks_url.is_none() {
            if self.auth.idp_host.is_none() {
                missing.push("CIVIL_IDP_LOCAL_HOSTNAME");
            }
            if self.auth.idp_port.is_none() {
                missing.push("CIVIL_IDP_LOCAL_PORT");
            }
            if self.registry.namespace.is_none() && self.registry.mode == RegistryMode::Static {
                missing.push("CIVIL_CLOUD_MAP_NAMESPACE");
            }
        }

        if self.auth.allowed_client_ids.is_empty() {
            missing.push("CIVIL_ALLOWED_CLIENT_IDS");
        }

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        if !self.server.route_prefix.starts_with('/') || self.server.route_prefix.ends_with('/') {
            return Err(ConfigError::Invalid {
                name: "server.route_prefix",
                reason: "must start with '/' and not end with '/'".to_string(),
            });
        }

        if self.auth.algorithms.is_empty() {
            return Err(ConfigError::Invalid {
                name: "auth.algorithms",
                reason: "at least one algorithm is required".to_string(),
            });
        }

        // A decoding key serves a single key family
        let family = key_family(self.auth.algorithms[0]);
        if let Some(other) = self.auth.algorithms.iter().find(|alg| key_family(**alg) != family) {
            return Err(ConfigError::Invalid {
                name: "auth.algorithms",
                reason: format!("{:?} is not a {} algorithm like {:?}", other, family, self.auth.algorithms[0]),
            });
        }

        Ok(())
    }

    /// Key-set endpoint of the same-cluster identity provider
    pub fn jwks_url(&self) -> Option<String> {
        if let Some(url) = &self.auth.jwks_url {
            return Some(url.clone());
        }
        let host = self.auth.idp_host.as_ref()?;
        let namespace = self.registry.namespace.as_ref()?;
        let port = self.auth.idp_port?;
        Some(format!("http://{}.{}:{}/keys", host, namespace, port))
    }
}

fn key_family(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => "HMAC",
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => "RSA",
        Algorithm::ES256 | Algorithm::ES384 => "EC",
        Algorithm::EdDSA => "EdDSA",
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
