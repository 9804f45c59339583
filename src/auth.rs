//! Bearer token verification against the identity provider's published keys
//!
//! A request is authenticated in four steps, any of which short-circuits:
//! the token is extracted, its signature and registered claims are checked,
//! its audience is matched against the allowed client applications, and the
//! identity claims are decoded. Only the key set outlives a request.

use crate::config::AuthConfig;
use crate::error::GatewayErrorCode;
use hyper::header::AUTHORIZATION;
use hyper::Request;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no bearer token in request")]
    MissingToken,

    #[error("token rejected: {0}")]
    InvalidToken(String),

    #[error("token audience is not an allowed client")]
    UnrecognizedClient,

    #[error("identity claims could not be decoded: {0}")]
    ClaimsDecode(String),
}

impl AuthError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            AuthError::MissingToken => GatewayErrorCode::MissingToken,
            AuthError::InvalidToken(_) => GatewayErrorCode::InvalidToken,
            AuthError::UnrecognizedClient => GatewayErrorCode::UnrecognizedClient,
            AuthError::ClaimsDecode(_) => GatewayErrorCode::ClaimsDecodeFailed,
        }
    }

    /// Message returned to the client; details stay in the logs
    pub fn public_message(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "Missing token",
            AuthError::InvalidToken(_) => "Invalid or expired token",
            AuthError::UnrecognizedClient => "Unrecognized client application",
            AuthError::ClaimsDecode(_) => "Failed to parse identity claims",
        }
    }
}

/// Identity of the caller, decoded from a verified token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    #[serde(rename = "sub")]
    pub subject: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub preferred_username: String,
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

/// Pull the bearer token from the Authorization header, falling back to a
/// query parameter for clients (map widgets, image tags) that cannot set headers.
pub fn extract_token<B>(req: &Request<B>, query_param: &str) -> Option<String> {
    let from_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|t| !t.is_empty());

    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    req.uri()
        .query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == query_param)
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
        .filter(|t| !t.is_empty())
}

/// Lazily fetched, refreshable copy of the identity provider's key set
pub struct JwksCache {
    url: String,
    http: reqwest::Client,
    keys: RwLock<Option<JwkSet>>,
    /// Serializes fetches and records when the last one started
    last_attempt: Mutex<Option<Instant>>,
    min_refresh_interval: Duration,
}

impl JwksCache {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        min_refresh_interval: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            url: url.into(),
            http: reqwest::Client::builder().timeout(timeout).build()?,
            keys: RwLock::new(None),
            last_attempt: Mutex::new(None),
            min_refresh_interval,
        })
    }

    /// Candidate verification keys for a token header's `kid`.
    ///
    /// A cache miss triggers at most one fetch per refresh interval,
    /// successful or not. Concurrent misses wait for the fetch in flight
    /// and use its result. A token without `kid` is tried against every key.
    pub async fn keys_for(&self, kid: Option<&str>) -> Result<Vec<DecodingKey>, AuthError> {
        if let Some(keys) = self.cached_keys(kid) {
            return Ok(keys);
        }

        let mut last_attempt = self.last_attempt.lock().await;
        if let Some(keys) = self.cached_keys(kid) {
            return Ok(keys);
        }

        let due = last_attempt.map_or(true, |at| at.elapsed() >= self.min_refresh_interval);
        if due {
            *last_attempt = Some(Instant::now());
            match self.fetch().await {
                Ok(set) => {
                    info!(url = %self.url, keys = set.keys.len(), "Fetched signing keys");
                    *self.keys.write() = Some(set);
                }
                Err(e) => error!(url = %self.url, error = %e, "Failed to fetch signing keys"),
            }
        }
        drop(last_attempt);

        if self.keys.read().is_none() {
            return Err(AuthError::InvalidToken("signing keys unavailable".to_string()));
        }
        self.cached_keys(kid)
            .ok_or_else(|| AuthError::InvalidToken("unknown signing key".to_string()))
    }

    fn cached_keys(&self, kid: Option<&str>) -> Option<Vec<DecodingKey>> {
        self.keys.read().as_ref().and_then(|set| select_keys(set, kid))
    }

    async fn fetch(&self) -> Result<JwkSet, reqwest::Error> {
        self.http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<JwkSet>()
            .await
    }
}

fn select_keys(set: &JwkSet, kid: Option<&str>) -> Option<Vec<DecodingKey>> {
    let jwks: Vec<&Jwk> = match kid {
        Some(kid) => set.find(kid).into_iter().collect(),
        None => set.keys.iter().collect(),
    };

    let keys: Vec<DecodingKey> = jwks
        .into_iter()
        .filter_map(|jwk| match DecodingKey::from_jwk(jwk) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!(kid = ?jwk.common.key_id, error = %e, "Skipping unusable key");
                None
            }
        })
        .collect();

    (!keys.is_empty()).then_some(keys)
}

/// Verifies bearer tokens issued by the identity provider
pub struct TokenVerifier {
    jwks: JwksCache,
    validation: Validation,
    allowed_audiences: HashSet<String>,
    token_query_param: String,
}

impl TokenVerifier {
    pub fn new(jwks_url: impl Into<String>, config: &AuthConfig) -> Result<Self, reqwest::Error> {
        let jwks = JwksCache::new(
            jwks_url,
            config.jwks_timeout(),
            config.jwks_refresh_min_interval(),
        )?;

        // Audience is matched by hand so a mismatch maps to its own status
        let primary = config.algorithms.first().copied().unwrap_or(Algorithm::RS256);
        let mut validation = Validation::new(primary);
        validation.algorithms = config.algorithms.clone();
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.validate_aud = false;
        validation.leeway = config.leeway_secs;

        Ok(Self {
            jwks,
            validation,
            allowed_audiences: config.allowed_client_ids.iter().cloned().collect(),
            token_query_param: config.token_query_param.clone(),
        })
    }

    /// Authenticate a request, returning the caller's identity
    pub async fn authenticate<B>(&self, req: &Request<B>) -> Result<IdentityClaims, AuthError> {
        let token = extract_token(req, &self.token_query_param).ok_or(AuthError::MissingToken)?;
        self.verify(&token).await
    }

    /// Verify a raw token string
    pub async fn verify(&self, token: &str) -> Result<IdentityClaims, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("malformed header: {}", e)))?;

        if !self.validation.algorithms.contains(&header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "algorithm {:?} not accepted",
                header.alg
            )));
        }

        let keys = self.jwks.keys_for(header.kid.as_deref()).await?;

        let mut last_error = None;
        let mut payload = None;
        for key in &keys {
            match decode::<Value>(token, key, &self.validation) {
                Ok(data) => {
                    payload = Some(data.claims);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }

        let payload = match payload {
            Some(payload) => payload,
            None => {
                let reason = last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no usable key".to_string());
                return Err(AuthError::InvalidToken(reason));
            }
        };

        if !audience_allowed(&payload, &self.allowed_audiences) {
            warn!(aud = ?payload.get("aud"), "Token issued for an unrecognized client");
            return Err(AuthError::UnrecognizedClient);
        }

        serde_json::from_value::<IdentityClaims>(payload)
            .map_err(|e| AuthError::ClaimsDecode(e.to_string()))
    }
}

/// `aud` may be a single string or an array; any allowed entry is enough
fn audience_allowed(payload: &Value, allowed: &HashSet<String>) -> bool {
    match payload.get("aud") {
        Some(Value::String(aud)) => allowed.contains(aud),
        Some(Value::Array(auds)) => auds
            .iter()
            .filter_map(Value::as_str)
            .any(|aud| allowed.contains(aud)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KID: &str = "gateway-test-key";
    const ISSUER: &str = "https://auth.civillabs.app";

    fn jwks_json() -> Value {
        serde_json::from_str(include_str!("../tests/fixtures/idp_jwks.json")).unwrap()
    }

    fn mint(claims: Value, kid: Option<&str>) -> String {
        let key = EncodingKey::from_rsa_pem(include_bytes!("../tests/fixtures/idp_rsa_private.pem")).unwrap();
        let mut header = Header::new(Algorithm::RS256);
        header.kid = kid.map(String::from);
        encode(&header, &claims, &key).unwrap()
    }

    fn claims(aud: Value) -> Value {
        json!({
            "iss": ISSUER,
            "sub": "user-42",
            "aud": aud,
            "exp": Utc::now().timestamp() + 600,
            "email": "ada@example.com",
            "email_verified": true,
            "groups": ["mappers"]
        })
    }

    fn auth_config(refresh_secs: u64) -> AuthConfig {
        AuthConfig {
            allowed_client_ids: vec!["civil-prototype-frontend".to_string()],
            jwks_refresh_min_interval_secs: refresh_secs,
            ..AuthConfig::default()
        }
    }

    async fn idp(expected_fetches: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json()))
            .expect(expected_fetches)
            .mount(&server)
            .await;
        server
    }

    fn request(uri: &str, authorization: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_extract_token_from_header() {
        let req = request("/tiles/1/2/3.png", Some("Bearer abc.def.ghi"));
        assert_eq!(extract_token(&req, "token"), Some("abc.def.ghi".to_string()));

        let lowercase = request("/tiles", Some("bearer abc"));
        assert_eq!(extract_token(&lowercase, "token"), Some("abc".to_string()));
    }

    #[test]
    fn test_extract_token_falls_back_to_query() {
        let req = request("/tiles/1/2/3.png?foo=bar&token=abc%2Edef", None);
        assert_eq!(extract_token(&req, "token"), Some("abc.def".to_string()));

        // A malformed header does not hide a usable query token
        let basic = request("/tiles?token=xyz", Some("Basic dXNlcjpwYXNz"));
        assert_eq!(extract_token(&basic, "token"), Some("xyz".to_string()));

        let renamed = request("/tiles?access_token=xyz", None);
        assert_eq!(extract_token(&renamed, "access_token"), Some("xyz".to_string()));
    }

    #[test]
    fn test_extract_token_missing() {
        assert_eq!(extract_token(&request("/tiles", None), "token"), None);
        assert_eq!(extract_token(&request("/tiles", Some("Bearer ")), "token"), None);
        assert_eq!(extract_token(&request("/tiles?token=", None), "token"), None);
        assert_eq!(extract_token(&request("/tiles?tokens=abc", None), "token"), None);
    }

    #[test]
    fn test_audience_string_or_array() {
        let allowed: HashSet<String> = ["civil-prototype-frontend".to_string()].into();

        assert!(audience_allowed(&json!({"aud": "civil-prototype-frontend"}), &allowed));
        assert!(audience_allowed(
            &json!({"aud": ["other", "civil-prototype-frontend"]}),
            &allowed
        ));
        assert!(!audience_allowed(&json!({"aud": "other-app"}), &allowed));
        assert!(!audience_allowed(&json!({"aud": []}), &allowed));
        assert!(!audience_allowed(&json!({}), &allowed));
    }

    #[test]
    fn test_identity_claims_defaults() {
        let claims: IdentityClaims = serde_json::from_value(json!({"sub": "user-1"})).unwrap();
        assert_eq!(claims.subject, "user-1");
        assert_eq!(claims.email, "");
        assert!(!claims.email_verified);
        assert!(claims.groups.is_empty());

        assert!(serde_json::from_value::<IdentityClaims>(json!({"sub": "u", "groups": "admins"})).is_err());
        assert!(serde_json::from_value::<IdentityClaims>(json!({"email": "a@b.c"})).is_err());
    }

    #[test]
    fn test_error_codes_and_messages() {
        assert_eq!(AuthError::MissingToken.code(), GatewayErrorCode::MissingToken);
        assert_eq!(
            AuthError::InvalidToken("expired".into()).public_message(),
            "Invalid or expired token"
        );
        assert_eq!(AuthError::UnrecognizedClient.code().status_code().as_u16(), 403);
        assert_eq!(AuthError::ClaimsDecode("x".into()).code().status_code().as_u16(), 500);
    }

    #[tokio::test]
    async fn test_verify_valid_token() {
        let server = idp(1).await;
        let verifier = TokenVerifier::new(format!("{}/keys", server.uri()), &auth_config(5)).unwrap();

        let token = mint(claims(json!("civil-prototype-frontend")), Some(KID));
        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.subject, "user-42");
        assert!(identity.email_verified);
        assert!(identity.groups.contains("mappers"));

        // Key set is cached
        verifier.verify(&token).await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_token_without_kid_tries_all_keys() {
        let server = idp(1).await;
        let verifier = TokenVerifier::new(format!("{}/keys", server.uri()), &auth_config(5)).unwrap();

        let token = mint(claims(json!(["civil-prototype-frontend"])), None);
        assert!(verifier.verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_audience_and_issuer() {
        let server = idp(1).await;
        let verifier = TokenVerifier::new(format!("{}/keys", server.uri()), &auth_config(5)).unwrap();

        let wrong_aud = mint(claims(json!("someone-else")), Some(KID));
        assert_eq!(verifier.verify(&wrong_aud).await, Err(AuthError::UnrecognizedClient));

        let mut foreign = claims(json!("civil-prototype-frontend"));
        foreign["iss"] = json!("https://evil.example.com");
        let wrong_iss = mint(foreign, Some(KID));
        assert!(matches!(verifier.verify(&wrong_iss).await, Err(AuthError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_verify_rejects_expired_token() {
        let server = idp(1).await;
        let verifier = TokenVerifier::new(format!("{}/keys", server.uri()), &auth_config(5)).unwrap();

        let mut expired = claims(json!("civil-prototype-frontend"));
        expired["exp"] = json!(Utc::now().timestamp() - 3600);
        let token = mint(expired, Some(KID));
        assert!(matches!(verifier.verify(&token).await, Err(AuthError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_claims_decode_failure_after_verification() {
        let server = idp(1).await;
        let verifier = TokenVerifier::new(format!("{}/keys", server.uri()), &auth_config(5)).unwrap();

        let mut odd = claims(json!("civil-prototype-frontend"));
        odd["email_verified"] = json!("yes");
        let token = mint(odd, Some(KID));
        assert!(matches!(verifier.verify(&token).await, Err(AuthError::ClaimsDecode(_))));
    }

    #[tokio::test]
    async fn test_unknown_kid_refetch_is_rate_limited() {
        // One fetch on first use; the unknown kid inside the interval does not refetch
        let server = idp(1).await;
        let verifier = TokenVerifier::new(format!("{}/keys", server.uri()), &auth_config(60)).unwrap();

        let good = mint(claims(json!("civil-prototype-frontend")), Some(KID));
        verifier.verify(&good).await.unwrap();

        let rotated = mint(claims(json!("civil-prototype-frontend")), Some("rotated-key"));
        assert_eq!(
            verifier.verify(&rotated).await,
            Err(AuthError::InvalidToken("unknown signing key".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unknown_kid_refetches_after_interval() {
        let server = idp(2).await;
        let verifier = TokenVerifier::new(format!("{}/keys", server.uri()), &auth_config(0)).unwrap();

        let good = mint(claims(json!("civil-prototype-frontend")), Some(KID));
        verifier.verify(&good).await.unwrap();

        let rotated = mint(claims(json!("civil-prototype-frontend")), Some("rotated-key"));
        assert!(verifier.verify(&rotated).await.is_err());
    }

    #[tokio::test]
    async fn test_key_set_unavailable_is_invalid_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let verifier = TokenVerifier::new(format!("{}/keys", server.uri()), &auth_config(5)).unwrap();

        let token = mint(claims(json!("civil-prototype-frontend")), Some(KID));
        assert!(matches!(verifier.verify(&token).await, Err(AuthError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_concurrent_cache_misses_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(jwks_json())
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let verifier = std::sync::Arc::new(
            TokenVerifier::new(format!("{}/keys", server.uri()), &auth_config(5)).unwrap(),
        );

        let token = mint(claims(json!("civil-prototype-frontend")), Some(KID));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..30 {
            let verifier = std::sync::Arc::clone(&verifier);
            let token = token.clone();
            tasks.spawn(async move { verifier.verify(&token).await });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_retried_within_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        let verifier = TokenVerifier::new(format!("{}/keys", server.uri()), &auth_config(60)).unwrap();

        let token = mint(claims(json!("civil-prototype-frontend")), Some(KID));
        for _ in 0..10 {
            assert_eq!(
                verifier.verify(&token).await,
                Err(AuthError::InvalidToken("signing keys unavailable".to_string()))
            );
        }
    }

    #[tokio::test]
    async fn test_fetch_recovers_after_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json()))
            .expect(1)
            .mount(&server)
            .await;
        let verifier = TokenVerifier::new(format!("{}/keys", server.uri()), &auth_config(0)).unwrap();

        let token = mint(claims(json!("civil-prototype-frontend")), Some(KID));
        assert!(verifier.verify(&token).await.is_err());
        assert!(verifier.verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_token_makes_no_key_request() {
        let server = idp(0).await;
        let verifier = TokenVerifier::new(format!("{}/keys", server.uri()), &auth_config(5)).unwrap();

        let req = request("/tiles/0/0/0.png", None);
        assert_eq!(verifier.authenticate(&req).await, Err(AuthError::MissingToken));
    }
}
