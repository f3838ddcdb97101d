//! Client configuration loading for the chat backend.
//!
//! Callers that display settings should use `ClientPublicConfig`, which omits the token.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::auth::AuthScheme;
use super::retry::RetryConfig;

const DEFAULT_API_URL: &str = "http://localhost:8001";
const CHAT_API_PREFIX: &str = "/api/v1/chat";
const AUTH_API_PREFIX: &str = "/api/v1/auth";

/// Configuration for the chat REST backend and its streaming endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub base_url: String,
    pub auth_scheme: AuthScheme,
    pub access_token: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: normalize_api_base(DEFAULT_API_URL),
            auth_scheme: AuthScheme::Bearer,
            access_token: None,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = normalize_api_base(base_url);
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Absolute URL for a path below the chat API prefix.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Absolute URL for a path below the sibling auth API prefix.
    pub fn auth_endpoint(&self, path: &str) -> String {
        let origin = self
            .base_url
            .strip_suffix(CHAT_API_PREFIX)
            .unwrap_or(&self.base_url);
        format!(
            "{}{}/{}",
            origin,
            AUTH_API_PREFIX,
            path.trim_start_matches('/')
        )
    }
}

fn parse_auth_scheme(raw: &str) -> AuthScheme {
    match raw.trim().to_ascii_lowercase().as_str() {
        "token" => AuthScheme::Token,
        _ => AuthScheme::Bearer,
    }
}

/// Ensures the base ends in the chat API prefix exactly once, without a trailing slash.
fn normalize_api_base(base_url: &str) -> String {
    let mut base = base_url.trim().trim_end_matches('/').to_string();
    if !base.ends_with(CHAT_API_PREFIX) {
        base.push_str(CHAT_API_PREFIX);
    }
    base
}

/// Load client configuration from `.env`/environment.
///
/// Reads:
/// - `CHAT_API_URL` (fallback: `API_URL`)
/// - `CHAT_API_TOKEN`
/// - `CHAT_AUTH_SCHEME` (`bearer` | `token`)
/// - `CHAT_REQUEST_TIMEOUT_SECS`, `CHAT_CONNECT_TIMEOUT_SECS`
/// - retry settings, see `RetryConfig::from_env`
pub fn load_client_config() -> ClientConfig {
    let _ = dotenvy::dotenv();

    let base_url = std::env::var("CHAT_API_URL")
        .or_else(|_| std::env::var("API_URL"))
        .unwrap_or_else(|_| DEFAULT_API_URL.to_string());

    let access_token = std::env::var("CHAT_API_TOKEN")
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    ClientConfig {
        base_url: normalize_api_base(&base_url),
        auth_scheme: parse_auth_scheme(&std::env::var("CHAT_AUTH_SCHEME").unwrap_or_default()),
        access_token,
        request_timeout: Duration::from_secs(env_or("CHAT_REQUEST_TIMEOUT_SECS", 30u64).clamp(1, 600)),
        connect_timeout: Duration::from_secs(env_or("CHAT_CONNECT_TIMEOUT_SECS", 10u64).clamp(1, 120)),
        retry: RetryConfig::from_env(),
    }
}

/// Parse an environment variable, falling back to `default` when unset or malformed.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Client configuration safe to show in a settings view (token omitted).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPublicConfig {
    pub base_url: String,
    pub auth_scheme: AuthScheme,
    pub has_access_token: bool,
}

impl From<&ClientConfig> for ClientPublicConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            auth_scheme: config.auth_scheme,
            has_access_token: config.access_token.is_some(),
        }
    }
}
