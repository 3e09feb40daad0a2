//! Token and service-discovery contracts
//!
//! The HTTP exchange itself is owned by a [`TokenService`] implementation; this
//! module defines what goes in and out of it plus the renewal scheduling math
//! used by token sessions.

use core::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, RestError};
use crate::transport::Endpoint;
use crate::types::serde_millis;

/// Tokens are never renewed with less than this much lifetime remaining
pub const MIN_RENEWAL_LEAD: Duration = Duration::from_secs(5);

/// Shortest delay between a token arriving and its renewal
pub const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

const MIN_REISSUE_RATIO: f64 = 0.05;

// ----------------------------------------------------------------------------
// Credentials and Tokens
// ----------------------------------------------------------------------------

/// OAuth credentials shared by every channel of a token session
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub user_name: String,
    pub password: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Ask the application for fresh secrets before each password grant
    #[serde(default)]
    pub use_renewal_callback: bool,
}

fn default_scope() -> String {
    String::from("trapi.streaming.pricing.read")
}

impl OAuthCredentials {
    pub fn new(
        user_name: impl Into<String>,
        password: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            user_name: user_name.into(),
            password: password.into(),
            client_id: client_id.into(),
            client_secret: None,
            scope: default_scope(),
            use_renewal_callback: false,
        }
    }

    /// Identity under which channels share a token session
    pub fn key(&self) -> CredentialKey {
        CredentialKey {
            user_name: self.user_name.clone(),
            client_id: self.client_id.clone(),
        }
    }

    /// Apply secrets supplied by the application
    pub fn apply_renewal(&mut self, renewal: &CredentialRenewal) {
        if let Some(password) = &renewal.password {
            self.password = password.clone();
        }
        if let Some(secret) = &renewal.client_secret {
            self.client_secret = Some(secret.clone());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_name.is_empty() || self.client_id.is_empty() {
            return Err(ConfigError::invalid(
                "credentials need a user name and a client id",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("scope", &self.scope)
            .field("use_renewal_callback", &self.use_renewal_callback)
            .finish()
    }
}

/// Key identifying a distinct credential set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub user_name: String,
    pub client_id: String,
}

/// Secrets supplied by the application from its renewal callback
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialRenewal {
    pub password: Option<String>,
    pub client_secret: Option<String>,
}

impl fmt::Debug for CredentialRenewal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRenewal")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Token issued by the token service
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(with = "serde_millis")]
    pub expires_in: Duration,
    pub token_type: String,
}

impl AccessToken {
    pub fn bearer(access_token: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_in,
            token_type: String::from("Bearer"),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

/// How a token request authenticates
#[derive(Clone, PartialEq, Eq)]
pub enum TokenGrant {
    Password { user_name: String, password: String },
    RefreshToken { user_name: String, refresh_token: String },
    ClientCredentials { client_secret: String },
}

impl TokenGrant {
    pub fn name(&self) -> &'static str {
        match self {
            TokenGrant::Password { .. } => "password",
            TokenGrant::RefreshToken { .. } => "refresh_token",
            TokenGrant::ClientCredentials { .. } => "client_credentials",
        }
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenGrant({})", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub url: String,
    pub client_id: String,
    pub scope: String,
    pub grant: TokenGrant,
    pub timeout: Duration,
}

impl TokenRequest {
    /// Grant to use for `credentials`, preferring a refresh token when one is held
    pub fn grant_for(credentials: &OAuthCredentials, refresh_token: Option<&str>) -> TokenGrant {
        match (refresh_token, &credentials.client_secret) {
            (Some(refresh_token), _) => TokenGrant::RefreshToken {
                user_name: credentials.user_name.clone(),
                refresh_token: refresh_token.to_owned(),
            },
            (None, Some(secret)) if credentials.password.is_empty() => {
                TokenGrant::ClientCredentials {
                    client_secret: secret.clone(),
                }
            }
            (None, _) => TokenGrant::Password {
                user_name: credentials.user_name.clone(),
                password: credentials.password.clone(),
            },
        }
    }
}

/// Transport filter for service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryTransport {
    Tcp,
    WebSocket,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequest {
    pub url: String,
    pub access_token: String,
    pub transport: DiscoveryTransport,
    pub timeout: Duration,
}

/// One endpoint advertised by service discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub endpoint: Endpoint,
    pub locations: Vec<String>,
    pub transport: DiscoveryTransport,
}

/// Pick the `transport` endpoint for `location`, preferring entries spanning more zones
pub fn select_endpoint(
    endpoints: &[ServiceEndpoint],
    transport: DiscoveryTransport,
    location: Option<&str>,
) -> Option<Endpoint> {
    endpoints
        .iter()
        .filter(|candidate| candidate.transport == transport)
        .filter(|candidate| match location {
            Some(location) => candidate
                .locations
                .iter()
                .any(|zone| zone.starts_with(location)),
            None => true,
        })
        .enumerate()
        .max_by_key(|(index, candidate)| (candidate.locations.len(), core::cmp::Reverse(*index)))
        .map(|(_, candidate)| candidate.endpoint.clone())
}

/// Token endpoint and service-discovery collaborator
#[async_trait]
pub trait TokenService: Send + Sync {
    async fn request_token(&self, request: TokenRequest) -> Result<AccessToken, RestError>;

    async fn discover_endpoints(
        &self,
        request: DiscoveryRequest,
    ) -> Result<Vec<ServiceEndpoint>, RestError>;
}

// ----------------------------------------------------------------------------
// Renewal Scheduling
// ----------------------------------------------------------------------------

/// Token renewal settings shared by every session of a reactor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub token_service_url: String,
    pub service_discovery_url: String,
    pub discovery_transport: DiscoveryTransport,
    /// Fraction of `expires_in` after which the token is renewed
    pub reissue_ratio: f64,
    /// Failed renewals tolerated before a warning; `None` retries forever
    pub reissue_attempt_limit: Option<u32>,
    #[serde(with = "serde_millis")]
    pub reissue_attempt_interval: Duration,
    #[serde(with = "serde_millis")]
    pub request_timeout: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            token_service_url: String::from("https://api.refinitiv.com/auth/oauth2/v1/token"),
            service_discovery_url: String::from(
                "https://api.refinitiv.com/streaming/pricing/v1/",
            ),
            discovery_transport: DiscoveryTransport::Tcp,
            reissue_ratio: 0.8,
            reissue_attempt_limit: None,
            reissue_attempt_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(90),
        }
    }
}

impl TokenConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.reissue_ratio > 0.0 && self.reissue_ratio <= 1.0) {
            return Err(ConfigError::invalid(format!(
                "token reissue_ratio must be in (0, 1], got {}",
                self.reissue_ratio
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("token request_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Delay between receiving a token and renewing it
///
/// `expires_in` is scaled by the ratio (clamped to `[0.05, 1.0]`), then capped
/// so that at least [`MIN_RENEWAL_LEAD`] remains before expiry, and floored at
/// [`MIN_RENEWAL_DELAY`].
pub fn renewal_delay(expires_in: Duration, ratio: f64) -> Duration {
    let ratio = if ratio.is_finite() {
        ratio.clamp(MIN_REISSUE_RATIO, 1.0)
    } else {
        1.0
    };
    let scaled = expires_in.mul_f64(ratio);
    let latest = expires_in.saturating_sub(MIN_RENEWAL_LEAD);
    scaled.min(latest).max(MIN_RENEWAL_DELAY)
}

/// Delay before retrying a failed renewal
pub fn retry_interval(interval: Duration, retry_after: Option<Duration>) -> Duration {
    retry_after.map_or(interval, |hint| interval.max(hint))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_endpoint(host: &str, locations: &[&str]) -> ServiceEndpoint {
        ServiceEndpoint {
            endpoint: Endpoint::new(host, 14002),
            locations: locations.iter().map(|zone| zone.to_string()).collect(),
            transport: DiscoveryTransport::Tcp,
        }
    }

    #[test]
    fn test_renewal_delay_uses_ratio() {
        assert_eq!(
            renewal_delay(Duration::from_secs(600), 0.8),
            Duration::from_secs(480)
        );
    }

    #[test]
    fn test_renewal_delay_keeps_minimum_lead() {
        assert_eq!(
            renewal_delay(Duration::from_secs(20), 1.0),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_renewal_delay_floor() {
        assert_eq!(renewal_delay(Duration::from_secs(3), 0.8), MIN_RENEWAL_DELAY);
        assert_eq!(renewal_delay(Duration::from_secs(100), 0.0), Duration::from_secs(5));
        assert_eq!(
            renewal_delay(Duration::from_secs(100), f64::NAN),
            Duration::from_secs(95)
        );
    }

    #[test]
    fn test_retry_interval_honours_hint() {
        let interval = Duration::from_secs(5);
        assert_eq!(retry_interval(interval, None), interval);
        assert_eq!(retry_interval(interval, Some(Duration::from_secs(1))), interval);
        assert_eq!(
            retry_interval(interval, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_grant_prefers_refresh_token() {
        let credentials = OAuthCredentials::new("user", "secret", "client");
        assert_eq!(
            TokenRequest::grant_for(&credentials, Some("refresh")).name(),
            "refresh_token"
        );
        assert_eq!(TokenRequest::grant_for(&credentials, None).name(), "password");

        let mut service_account = OAuthCredentials::new("svc", "", "client");
        service_account.client_secret = Some("s3cr3t".into());
        assert_eq!(
            TokenRequest::grant_for(&service_account, None).name(),
            "client_credentials"
        );
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let mut credentials = OAuthCredentials::new("user", "hunter2", "client");
        credentials.client_secret = Some("topsecret".into());
        let rendered = format!("{:?}", credentials);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("topsecret"));
        assert!(rendered.contains("user"));
    }

    #[test]
    fn test_apply_renewal() {
        let mut credentials = OAuthCredentials::new("user", "old", "client");
        credentials.apply_renewal(&CredentialRenewal {
            password: Some("new".into()),
            client_secret: None,
        });
        assert_eq!(credentials.password, "new");
        assert_eq!(credentials.client_secret, None);
    }

    #[test]
    fn test_select_endpoint_by_location() {
        let endpoints = vec![
            create_test_endpoint("single-east", &["us-east-1a"]),
            create_test_endpoint("multi-east", &["us-east-1a", "us-east-1b"]),
            create_test_endpoint("multi-west", &["eu-west-1a", "eu-west-1b"]),
        ];

        assert_eq!(
            select_endpoint(&endpoints, DiscoveryTransport::Tcp, Some("us-east")).map(|e| e.host),
            Some("multi-east".to_string())
        );
        assert_eq!(
            select_endpoint(&endpoints, DiscoveryTransport::Tcp, Some("eu-west")).map(|e| e.host),
            Some("multi-west".to_string())
        );
        assert_eq!(select_endpoint(&endpoints, DiscoveryTransport::Tcp, Some("ap-south")), None);
        assert_eq!(
            select_endpoint(&endpoints, DiscoveryTransport::Tcp, None).map(|e| e.host),
            Some("multi-east".to_string())
        );
    }

    #[test]
    fn test_select_endpoint_matches_transport() {
        let mut websocket = create_test_endpoint("ws-east", &["us-east-1a", "us-east-1b"]);
        websocket.transport = DiscoveryTransport::WebSocket;
        let endpoints = vec![websocket, create_test_endpoint("tcp-east", &["us-east-1a"])];

        assert_eq!(
            select_endpoint(&endpoints, DiscoveryTransport::Tcp, Some("us-east")).map(|e| e.host),
            Some("tcp-east".to_string())
        );
        assert_eq!(
            select_endpoint(&endpoints, DiscoveryTransport::WebSocket, None).map(|e| e.host),
            Some("ws-east".to_string())
        );
        assert_eq!(
            select_endpoint(&endpoints[1..], DiscoveryTransport::WebSocket, None),
            None
        );
    }

    #[test]
    fn test_token_config_validation() {
        assert!(TokenConfig::default().validate().is_ok());

        let config = TokenConfig {
            reissue_ratio: 0.0,
            ..TokenConfig::default()
        };
        assert!(config.validate().is_err());

        let config = TokenConfig {
            reissue_ratio: 1.5,
            ..TokenConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
