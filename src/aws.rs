//! AWS credentials and Signature Version 4 request signing
//!
//! The registry talks to the Cloud Map data plane directly over HTTPS, so
//! this module carries the small part of the AWS request protocol it needs:
//! resolving credentials along the SDK default chain and producing the
//! `AWS4-HMAC-SHA256` authorization headers.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Address of the ECS task metadata credentials endpoint
const ECS_CREDENTIALS_HOST: &str = "http://169.254.170.2";

/// Default EC2 instance metadata endpoint
const IMDS_ENDPOINT: &str = "http://169.254.169.254";

const IMDS_TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";
const IMDS_TOKEN_TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
const IMDS_TOKEN_TTL_SECS: &str = "21600";

/// Temporary credentials are refreshed this long before they expire
const EXPIRY_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("credentials endpoint request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("credentials endpoint returned status {0}")]
    Status(u16),

    #[error("failed to read token file {path}: {source}")]
    TokenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unusable credentials response: {0}")]
    Malformed(String),
}

#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AwsCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expires_at: None,
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - ChronoDuration::minutes(EXPIRY_MARGIN_MINUTES) > now,
            None => true,
        }
    }
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Where credentials come from
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// Keys from the environment or the shared credentials file
    Static(AwsCredentials),
    /// Role assumed with an OIDC token file (EKS service accounts)
    WebIdentity {
        sts_endpoint: String,
        role_arn: String,
        session_name: String,
        token_file: PathBuf,
    },
    /// Temporary task-role credentials served by the container agent
    Container {
        url: String,
        authorization_token: Option<String>,
        /// Re-read on every fetch; wins over `authorization_token`
        authorization_token_file: Option<PathBuf>,
    },
    /// Instance-profile credentials from the EC2 metadata service (IMDSv2)
    InstanceMetadata { endpoint: String },
}

impl CredentialSource {
    /// Resolve the credential source in the order of the AWS SDK default
    /// chain: environment keys, the shared credentials file, web identity,
    /// the container endpoint and finally instance metadata.
    ///
    /// Returns `None` only when nothing is configured and instance metadata
    /// is disabled with `AWS_EC2_METADATA_DISABLED`.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let (Some(access_key_id), Some(secret_access_key)) =
            (get("AWS_ACCESS_KEY_ID"), get("AWS_SECRET_ACCESS_KEY"))
        {
            return Some(CredentialSource::Static(AwsCredentials {
                access_key_id,
                secret_access_key,
                session_token: get("AWS_SESSION_TOKEN"),
                expires_at: None,
            }));
        }

        let profile = get("AWS_PROFILE").unwrap_or_else(|| "default".to_string());
        let credentials_file = get("AWS_SHARED_CREDENTIALS_FILE")
            .map(PathBuf::from)
            .or_else(|| dirs_next::home_dir().map(|home| home.join(".aws").join("credentials")));
        if let Some(credentials) = credentials_file
            .as_deref()
            .and_then(|path| read_profile(path, &profile))
        {
            return Some(CredentialSource::Static(credentials));
        }

        if let (Some(role_arn), Some(token_file)) =
            (get("AWS_ROLE_ARN"), get("AWS_WEB_IDENTITY_TOKEN_FILE"))
        {
            let sts_endpoint = get("AWS_ENDPOINT_URL_STS").unwrap_or_else(|| {
                match get("AWS_REGION").or_else(|| get("AWS_DEFAULT_REGION")) {
                    Some(region) => format!("https://sts.{}.amazonaws.com", region),
                    None => "https://sts.amazonaws.com".to_string(),
                }
            });
            let session_name = get("AWS_ROLE_SESSION_NAME")
                .unwrap_or_else(|| format!("{}-{}", crate::PKG_NAME, Utc::now().timestamp()));
            return Some(CredentialSource::WebIdentity {
                sts_endpoint,
                role_arn,
                session_name,
                token_file: PathBuf::from(token_file),
            });
        }

        let container_url = get("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI")
            .map(|relative| format!("{}{}", ECS_CREDENTIALS_HOST, relative))
            .or_else(|| get("AWS_CONTAINER_CREDENTIALS_FULL_URI"));
        if let Some(url) = container_url {
            return Some(CredentialSource::Container {
                url,
                authorization_token: get("AWS_CONTAINER_AUTHORIZATION_TOKEN"),
                authorization_token_file: get("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE").map(PathBuf::from),
            });
        }

        if get("AWS_EC2_METADATA_DISABLED").is_some_and(|v| v.trim().eq_ignore_ascii_case("true")) {
            return None;
        }

        let endpoint = get("AWS_EC2_METADATA_SERVICE_ENDPOINT")
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| IMDS_ENDPOINT.to_string());
        Some(CredentialSource::InstanceMetadata { endpoint })
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            CredentialSource::Static(_) => "static",
            CredentialSource::WebIdentity { .. } => "web-identity",
            CredentialSource::Container { .. } => "container",
            CredentialSource::InstanceMetadata { .. } => "instance-metadata",
        }
    }
}

/// Static keys for `profile` from a shared credentials file. Profiles that
/// assume roles or run credential processes are skipped.
fn read_profile(path: &Path, profile: &str) -> Option<AwsCredentials> {
    let contents = std::fs::read_to_string(path).ok()?;
    parse_profile(&contents, profile)
}

fn parse_profile(contents: &str, profile: &str) -> Option<AwsCredentials> {
    let mut in_profile = false;
    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;

    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_profile = section.trim() == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().to_string();
            match key.trim() {
                "aws_access_key_id" => access_key_id = Some(value),
                "aws_secret_access_key" => secret_access_key = Some(value),
                "aws_session_token" => session_token = Some(value),
                _ => {}
            }
        }
    }

    Some(AwsCredentials {
        access_key_id: access_key_id?,
        secret_access_key: secret_access_key?,
        session_token,
        expires_at: None,
    })
}

/// Body shared by the container endpoint and instance metadata
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TemporaryCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
    expiration: Option<DateTime<Utc>>,
}

impl From<TemporaryCredentials> for AwsCredentials {
    fn from(body: TemporaryCredentials) -> Self {
        AwsCredentials {
            access_key_id: body.access_key_id,
            secret_access_key: body.secret_access_key,
            session_token: body.token,
            expires_at: body.expiration,
        }
    }
}

/// STS answers in JSON when asked with `Accept: application/json`
#[derive(Debug, Deserialize)]
struct WebIdentityEnvelope {
    #[serde(rename = "AssumeRoleWithWebIdentityResponse")]
    response: WebIdentityResponse,
}

#[derive(Debug, Deserialize)]
struct WebIdentityResponse {
    #[serde(rename = "AssumeRoleWithWebIdentityResult")]
    result: WebIdentityResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WebIdentityResult {
    credentials: StsCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expiration: StsExpiration,
}

/// Epoch seconds in the JSON protocol, ISO 8601 in some compatible services
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StsExpiration {
    Epoch(f64),
    Timestamp(DateTime<Utc>),
}

impl StsExpiration {
    fn into_datetime(self) -> Option<DateTime<Utc>> {
        match self {
            StsExpiration::Epoch(secs) => Utc.timestamp_opt(secs as i64, 0).single(),
            StsExpiration::Timestamp(at) => Some(at),
        }
    }
}

/// Hands out valid credentials, refreshing temporary ones before expiry
pub struct CredentialsProvider {
    source: CredentialSource,
    http: reqwest::Client,
    cached: Mutex<Option<AwsCredentials>>,
}

impl CredentialsProvider {
    pub fn new(source: CredentialSource, timeout: Duration) -> Result<Self, CredentialsError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            source,
            http,
            cached: Mutex::new(None),
        })
    }

    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    pub async fn credentials(&self) -> Result<AwsCredentials, CredentialsError> {
        if let CredentialSource::Static(credentials) = &self.source {
            return Ok(credentials.clone());
        }

        // Held across the fetch so concurrent callers wait for one refresh
        let mut cached = self.cached.lock().await;
        if let Some(credentials) = cached.as_ref() {
            if credentials.is_fresh(Utc::now()) {
                return Ok(credentials.clone());
            }
        }

        let credentials = match &self.source {
            CredentialSource::Static(credentials) => credentials.clone(),
            CredentialSource::WebIdentity {
                sts_endpoint,
                role_arn,
                session_name,
                token_file,
            } => {
                self.assume_role_with_web_identity(sts_endpoint, role_arn, session_name, token_file)
                    .await?
            }
            CredentialSource::Container {
                url,
                authorization_token,
                authorization_token_file,
            } => {
                self.container(url, authorization_token.as_deref(), authorization_token_file.as_deref())
                    .await?
            }
            CredentialSource::InstanceMetadata { endpoint } => self.instance_metadata(endpoint).await?,
        };

        debug!(
            source = self.source.kind(),
            expires_at = ?credentials.expires_at,
            "Fetched AWS credentials"
        );
        *cached = Some(credentials.clone());
        Ok(credentials)
    }

    async fn container(
        &self,
        url: &str,
        authorization_token: Option<&str>,
        authorization_token_file: Option<&Path>,
    ) -> Result<AwsCredentials, CredentialsError> {
        let token = match authorization_token_file {
            Some(path) => Some(read_token_file(path).await?),
            None => authorization_token.map(String::from),
        };

        let mut request = self.http.get(url);
        if let Some(token) = token {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }
        let body: TemporaryCredentials = success(request.send().await?)?.json().await?;
        Ok(body.into())
    }

    async fn instance_metadata(&self, endpoint: &str) -> Result<AwsCredentials, CredentialsError> {
        let session = self
            .http
            .put(format!("{}/latest/api/token", endpoint))
            .header(IMDS_TOKEN_TTL_HEADER, IMDS_TOKEN_TTL_SECS)
            .send()
            .await?;
        let token = success(session)?.text().await?;
        let token = token.trim();

        let roles_url = format!("{}/latest/meta-data/iam/security-credentials/", endpoint);
        let roles = self
            .http
            .get(&roles_url)
            .header(IMDS_TOKEN_HEADER, token)
            .send()
            .await?;
        let roles = success(roles)?.text().await?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| CredentialsError::Malformed("no instance profile attached".to_string()))?;

        let response = self
            .http
            .get(format!("{}{}", roles_url, role))
            .header(IMDS_TOKEN_HEADER, token)
            .send()
            .await?;
        let body: TemporaryCredentials = success(response)?.json().await?;
        Ok(body.into())
    }

    async fn assume_role_with_web_identity(
        &self,
        sts_endpoint: &str,
        role_arn: &str,
        session_name: &str,
        token_file: &Path,
    ) -> Result<AwsCredentials, CredentialsError> {
        let token = read_token_file(token_file).await?;

        let response = self
            .http
            .post(format!("{}/", sts_endpoint.trim_end_matches('/')))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("Action", "AssumeRoleWithWebIdentity"),
                ("Version", "2011-06-15"),
                ("RoleArn", role_arn),
                ("RoleSessionName", session_name),
                ("WebIdentityToken", token.as_str()),
            ])
            .send()
            .await?;
        let envelope: WebIdentityEnvelope = success(response)?.json().await?;
        let credentials = envelope.response.result.credentials;

        Ok(AwsCredentials {
            access_key_id: credentials.access_key_id,
            secret_access_key: credentials.secret_access_key,
            session_token: Some(credentials.session_token),
            expires_at: credentials.expiration.into_datetime(),
        })
    }
}

fn success(response: reqwest::Response) -> Result<reqwest::Response, CredentialsError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(CredentialsError::Status(response.status().as_u16()))
    }
}

async fn read_token_file(path: &Path) -> Result<String, CredentialsError> {
    tokio::fs::read_to_string(path)
        .await
        .map(|token| token.trim().to_string())
        .map_err(|source| CredentialsError::TokenFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Signs requests for one AWS service in one region
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    region: String,
    service: String,
}

impl SigV4Signer {
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
        }
    }

    /// Compute the headers to add to a request.
    ///
    /// `headers` must contain every header that will be sent and signed,
    /// including `host`. Names are matched case-insensitively. The returned
    /// list holds `x-amz-date`, `x-amz-security-token` when a session token
    /// is present, and `authorization`.
    #[allow(clippy::too_many_arguments)]
    pub fn sign(
        &self,
        method: &str,
        path: &str,
        query: &str,
        headers: &[(&str, &str)],
        payload: &[u8],
        credentials: &AwsCredentials,
        now: DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut signed: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
            .collect();
        signed.push(("x-amz-date".to_string(), amz_date.clone()));
        if let Some(token) = &credentials.session_token {
            signed.push(("x-amz-security-token".to_string(), token.clone()));
        }
        signed.sort();

        let canonical_headers: String = signed
            .iter()
            .map(|(name, value)| format!("{}:{}\n", name, value))
            .collect();
        let signed_headers = signed
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            path,
            query,
            canonical_headers,
            signed_headers,
            hex::encode(Sha256::digest(payload))
        );

        let scope = format!("{}/{}/{}/aws4_request", date, self.region, self.service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = signing_key(&credentials.secret_access_key, &date, &self.region, &self.service);
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

        let mut out = vec![("x-amz-date", amz_date)];
        if let Some(token) = &credentials.session_token {
            out.push(("x-amz-security-token", token.clone()));
        }
        out.push((
            "authorization",
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
                credentials.access_key_id, scope, signed_headers, signature
            ),
        ));
        out
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    const EXAMPLE_SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";

    /// Environment lookup that never falls through to the real home directory
    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.entry("AWS_SHARED_CREDENTIALS_FILE".to_string())
            .or_insert_with(|| "/nonexistent/tile-gateway/credentials".to_string());
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_signing_key_matches_aws_example() {
        let key = signing_key(EXAMPLE_SECRET, "20120215", "us-east-1", "iam");
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_get_vanilla_signature() {
        let signer = SigV4Signer::new("us-east-1", "service");
        let credentials = AwsCredentials::new("AKIDEXAMPLE", EXAMPLE_SECRET);
        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();

        let headers = signer.sign(
            "GET",
            "/",
            "",
            &[("Host", "example.amazonaws.com")],
            b"",
            &credentials,
            now,
        );

        assert_eq!(headers[0], ("x-amz-date", "20150830T123600Z".to_string()));
        assert_eq!(
            headers[1].1,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
             SignedHeaders=host;x-amz-date, \
             Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        );
    }

    #[test]
    fn test_session_token_is_signed() {
        let signer = SigV4Signer::new("eu-west-1", "servicediscovery");
        let mut credentials = AwsCredentials::new("AKID", "secret");
        credentials.session_token = Some("session".to_string());

        let headers = signer.sign(
            "POST",
            "/",
            "",
            &[("host", "data-servicediscovery.eu-west-1.amazonaws.com")],
            b"{}",
            &credentials,
            Utc::now(),
        );

        assert_eq!(headers.len(), 3);
        assert_eq!(headers[1], ("x-amz-security-token", "session".to_string()));
        assert!(headers[2]
            .1
            .contains("SignedHeaders=host;x-amz-date;x-amz-security-token"));
    }

    #[test]
    fn test_static_credentials_from_environment() {
        let source = CredentialSource::from_lookup(lookup(&[
            ("AWS_ACCESS_KEY_ID", "AKID"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
            ("AWS_SESSION_TOKEN", "token"),
            ("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI", "/v2/credentials/abc"),
        ]))
        .unwrap();

        match source {
            CredentialSource::Static(credentials) => {
                assert_eq!(credentials.access_key_id, "AKID");
                assert_eq!(credentials.session_token.as_deref(), Some("token"));
            }
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn test_container_credentials_from_environment() {
        let source = CredentialSource::from_lookup(lookup(&[(
            "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI",
            "/v2/credentials/abc",
        )]))
        .unwrap();

        match source {
            CredentialSource::Container {
                url,
                authorization_token,
                authorization_token_file,
            } => {
                assert_eq!(url, "http://169.254.170.2/v2/credentials/abc");
                assert!(authorization_token.is_none());
                assert!(authorization_token_file.is_none());
            }
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn test_pod_identity_token_file_from_environment() {
        let source = CredentialSource::from_lookup(lookup(&[
            ("AWS_CONTAINER_CREDENTIALS_FULL_URI", "http://169.254.170.23/v1/credentials"),
            ("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE", "/var/run/secrets/pods.eks.amazonaws.com/token"),
        ]))
        .unwrap();

        match source {
            CredentialSource::Container {
                url,
                authorization_token_file,
                ..
            } => {
                assert_eq!(url, "http://169.254.170.23/v1/credentials");
                assert_eq!(
                    authorization_token_file,
                    Some(PathBuf::from("/var/run/secrets/pods.eks.amazonaws.com/token"))
                );
            }
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn test_web_identity_wins_over_container() {
        let source = CredentialSource::from_lookup(lookup(&[
            ("AWS_ROLE_ARN", "arn:aws:iam::123456789012:role/tile-gateway"),
            ("AWS_WEB_IDENTITY_TOKEN_FILE", "/var/run/secrets/eks.amazonaws.com/serviceaccount/token"),
            ("AWS_ROLE_SESSION_NAME", "gateway"),
            ("AWS_REGION", "eu-west-1"),
            ("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI", "/v2/credentials/abc"),
        ]))
        .unwrap();

        match source {
            CredentialSource::WebIdentity {
                sts_endpoint,
                role_arn,
                session_name,
                ..
            } => {
                assert_eq!(sts_endpoint, "https://sts.eu-west-1.amazonaws.com");
                assert_eq!(role_arn, "arn:aws:iam::123456789012:role/tile-gateway");
                assert_eq!(session_name, "gateway");
            }
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn test_instance_metadata_is_the_last_resort() {
        match CredentialSource::from_lookup(lookup(&[])).unwrap() {
            CredentialSource::InstanceMetadata { endpoint } => assert_eq!(endpoint, "http://169.254.169.254"),
            other => panic!("unexpected source: {other:?}"),
        }

        let custom = CredentialSource::from_lookup(lookup(&[(
            "AWS_EC2_METADATA_SERVICE_ENDPOINT",
            "http://127.0.0.1:1338/",
        )]))
        .unwrap();
        assert!(matches!(
            custom,
            CredentialSource::InstanceMetadata { ref endpoint } if endpoint == "http://127.0.0.1:1338"
        ));

        assert!(CredentialSource::from_lookup(lookup(&[("AWS_EC2_METADATA_DISABLED", "true")])).is_none());
    }

    #[test]
    fn test_shared_credentials_file_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        std::fs::write(
            &path,
            "# managed by ops\n\
             [default]\n\
             aws_access_key_id = AKIDDEFAULT\n\
             aws_secret_access_key = default-secret\n\
             \n\
             [tiles]\n\
             aws_access_key_id=AKIDTILES\n\
             aws_secret_access_key=tiles-secret\n\
             aws_session_token=tiles-session\n\
             \n\
             [assumed]\n\
             role_arn = arn:aws:iam::123456789012:role/other\n",
        )
        .unwrap();
        let file = path.to_str().unwrap();

        let source = CredentialSource::from_lookup(lookup(&[
            ("AWS_SHARED_CREDENTIALS_FILE", file),
            ("AWS_PROFILE", "tiles"),
        ]))
        .unwrap();
        match source {
            CredentialSource::Static(credentials) => {
                assert_eq!(credentials.access_key_id, "AKIDTILES");
                assert_eq!(credentials.session_token.as_deref(), Some("tiles-session"));
            }
            other => panic!("unexpected source: {other:?}"),
        }

        let default = CredentialSource::from_lookup(lookup(&[("AWS_SHARED_CREDENTIALS_FILE", file)])).unwrap();
        assert!(matches!(
            default,
            CredentialSource::Static(ref c) if c.access_key_id == "AKIDDEFAULT" && c.session_token.is_none()
        ));

        // A role-only profile falls through to the rest of the chain
        let assumed = CredentialSource::from_lookup(lookup(&[
            ("AWS_SHARED_CREDENTIALS_FILE", file),
            ("AWS_PROFILE", "assumed"),
        ]))
        .unwrap();
        assert_eq!(assumed.kind(), "instance-metadata");
    }

    #[test]
    fn test_sts_expiration_formats() {
        let epoch: StsExpiration = serde_json::from_str("1.7e9").unwrap();
        assert_eq!(epoch.into_datetime().unwrap().timestamp(), 1_700_000_000);

        let iso: StsExpiration = serde_json::from_str("\"2024-01-01T00:00:00Z\"").unwrap();
        assert_eq!(iso.into_datetime().unwrap().timestamp(), 1_704_067_200);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut credentials = AwsCredentials::new("AKID", "very-secret");
        credentials.session_token = Some("session-secret".to_string());
        let rendered = format!("{:?}", credentials);
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("very-secret"));
        assert!(!rendered.contains("session-secret"));
    }

    #[test]
    fn test_freshness_honours_margin() {
        let now = Utc::now();
        let mut credentials = AwsCredentials::new("AKID", "secret");
        assert!(credentials.is_fresh(now));

        credentials.expires_at = Some(now + ChronoDuration::minutes(3));
        assert!(!credentials.is_fresh(now));

        credentials.expires_at = Some(now + ChronoDuration::hours(1));
        assert!(credentials.is_fresh(now));
    }
}
