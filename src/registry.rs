//! Service registry collaborators
//!
//! The gateway only consumes the registry: it asks for the healthy instances
//! of one service and reads the address attributes of each. Cloud Map is the
//! production source; a static list covers local development.

use crate::aws::{CredentialsError, CredentialsProvider, SigV4Signer};
use crate::config::RegistryConfig;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Instance attribute holding the IPv4 address
pub const ATTR_IPV4: &str = "AWS_INSTANCE_IPV4";
/// Instance attribute holding the port
pub const ATTR_PORT: &str = "AWS_INSTANCE_PORT";

const DISCOVER_INSTANCES_TARGET: &str = "Route53AutoNaming_v20170314.DiscoverInstances";
const AMZ_JSON: &str = "application/x-amz-json-1.1";
const SIGNING_SERVICE: &str = "servicediscovery";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("registry returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid registry response: {0}")]
    Decode(String),

    #[error("registry credentials unavailable: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("invalid registry configuration: {0}")]
    Config(String),
}

/// One registered instance and its attributes
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegistryInstance {
    pub instance_id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl RegistryInstance {
    pub fn new(instance_id: impl Into<String>, ip: &str, port: Option<u16>) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(ATTR_IPV4.to_string(), ip.to_string());
        if let Some(port) = port {
            attributes.insert(ATTR_PORT.to_string(), port.to_string());
        }
        Self {
            instance_id: instance_id.into(),
            attributes,
        }
    }

    pub fn ip(&self) -> Option<&str> {
        self.attribute(ATTR_IPV4)
    }

    pub fn port(&self) -> Option<&str> {
        self.attribute(ATTR_PORT)
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Lookup of the healthy instances of the configured service
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn discover_instances(&self) -> Result<Vec<RegistryInstance>, RegistryError>;
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DiscoverInstancesRequest<'a> {
    namespace_name: &'a str,
    service_name: &'a str,
    health_status: &'static str,
    max_results: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiscoverInstancesResponse {
    #[serde(default)]
    instances: Vec<RegistryInstance>,
}

/// AWS Cloud Map `DiscoverInstances` client
pub struct CloudMapRegistry {
    http: reqwest::Client,
    endpoint: reqwest::Url,
    host: String,
    signer: SigV4Signer,
    credentials: CredentialsProvider,
    namespace: String,
    service_name: String,
    max_results: u32,
}

impl CloudMapRegistry {
    pub fn new(config: &RegistryConfig, credentials: CredentialsProvider) -> Result<Self, RegistryError> {
        let namespace = config
            .namespace
            .clone()
            .ok_or_else(|| RegistryError::Config("namespace is required".to_string()))?;
        let service_name = config
            .service_name
            .clone()
            .ok_or_else(|| RegistryError::Config("service name is required".to_string()))?;
        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());
        let endpoint_url = config
            .endpoint_url()
            .ok_or_else(|| RegistryError::Config("region or endpoint is required".to_string()))?;

        let endpoint = reqwest::Url::parse(&endpoint_url)
            .map_err(|e| RegistryError::Config(format!("endpoint '{}': {}", endpoint_url, e)))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(RegistryError::Config(format!(
                    "endpoint '{}' has no host",
                    endpoint_url
                )))
            }
        };

        let http = reqwest::Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            http,
            endpoint,
            host,
            signer: SigV4Signer::new(region, SIGNING_SERVICE),
            credentials,
            namespace,
            service_name,
            max_results: config.max_results,
        })
    }
}

#[async_trait]
impl ServiceRegistry for CloudMapRegistry {
    async fn discover_instances(&self) -> Result<Vec<RegistryInstance>, RegistryError> {
        let body = serde_json::to_vec(&DiscoverInstancesRequest {
            namespace_name: &self.namespace,
            service_name: &self.service_name,
            health_status: "HEALTHY",
            max_results: self.max_results,
        })
        .map_err(|e| RegistryError::Decode(e.to_string()))?;

        let credentials = self.credentials.credentials().await?;
        let auth_headers = self.signer.sign(
            "POST",
            self.endpoint.path(),
            self.endpoint.query().unwrap_or(""),
            &[
                ("content-type", AMZ_JSON),
                ("host", self.host.as_str()),
                ("x-amz-target", DISCOVER_INSTANCES_TARGET),
            ],
            &body,
            &credentials,
            Utc::now(),
        );

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, AMZ_JSON)
            .header("x-amz-target", DISCOVER_INSTANCES_TARGET)
            .body(body);
        for (name, value) in auth_headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: DiscoverInstancesResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;

        debug!(
            namespace = %self.namespace,
            service = %self.service_name,
            instances = parsed.instances.len(),
            "Discovered instances"
        );

        Ok(parsed.instances)
    }
}

/// Fixed instance list, for running without Cloud Map
#[derive(Debug, Clone)]
pub struct StaticRegistry {
    instances: Vec<RegistryInstance>,
}

impl StaticRegistry {
    /// Build from `host[:port]` strings
    pub fn from_addresses(addresses: &[String]) -> Result<Self, RegistryError> {
        let mut instances = Vec::with_capacity(addresses.len());
        for (index, address) in addresses.iter().enumerate() {
            let (host, port) = match address.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse::<u16>().map_err(|_| {
                        RegistryError::Config(format!("invalid port in static backend '{}'", address))
                    })?;
                    (host, Some(port))
                }
                None => (address.as_str(), None),
            };
            if host.is_empty() {
                return Err(RegistryError::Config(format!(
                    "static backend '{}' has no host",
                    address
                )));
            }
            instances.push(RegistryInstance::new(format!("static-{}", index), host, port));
        }
        Ok(Self { instances })
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn discover_instances(&self) -> Result<Vec<RegistryInstance>, RegistryError> {
        Ok(self.instances.clone())
    }
}
