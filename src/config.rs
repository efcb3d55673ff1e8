//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Inbound authentication configuration
    pub auth: AuthConfig,
    /// OAuth provider configuration
    pub provider: ProviderConfig,
    /// Calendar API configuration
    pub calendar: CalendarConfig,
    /// Credential storage configuration
    pub storage: StorageConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally reachable base URL, used to build the OAuth redirect URI
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 30000,
            public_url: None,
        }
    }
}

/// Inbound authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Service-wide bearer secret shared with the host.
    /// Supports a literal value or `env:VAR_NAME`.
    pub bearer_token: Option<String>,

    /// Paths that bypass authentication (default: `["/health"]`)
    pub public_paths: Vec<String>,

    /// Lifetime of per-user authorization tickets. Unset means tickets live
    /// until superseded or the process exits.
    #[serde(with = "humantime_serde")]
    pub ticket_ttl: Option<Duration>,

    /// Header carrying the host's per-user identifier
    pub user_id_header: String,

    /// User id assumed when the host does not send one
    pub default_user_id: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bearer_token: None,
            public_paths: vec!["/health".to_string()],
            ticket_ttl: None,
            user_id_header: "x-user-id".to_string(),
            default_user_id: "single_user".to_string(),
        }
    }
}

impl AuthConfig {
    /// Resolve the service bearer secret (expands `env:VAR`)
    #[must_use]
    pub fn resolve_bearer_token(&self) -> Option<String> {
        self.bearer_token
            .as_deref()
            .map(resolve_secret)
            .filter(|token| !token.is_empty())
    }
}

/// OAuth provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// OAuth client id
    pub client_id: Option<String>,
    /// OAuth client secret (supports `env:VAR_NAME`)
    pub client_secret: Option<String>,
    /// Consent screen endpoint
    pub authorization_endpoint: String,
    /// Token endpoint used for code exchange and refresh
    pub token_endpoint: String,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// Path of the OAuth callback on this service
    pub callback_path: String,
    /// Timeout for every provider HTTP call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How long a pending consent redirect stays valid
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            authorization_endpoint: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_endpoint: "https://oauth2.googleapis.com/token".to_string(),
            scopes: vec![
                "https://www.googleapis.com/auth/calendar.readonly".to_string(),
                "https://www.googleapis.com/auth/calendar.events".to_string(),
            ],
            callback_path: "/auth/callback".to_string(),
            request_timeout: Duration::from_secs(30),
            state_ttl: Duration::from_secs(600),
        }
    }
}

impl ProviderConfig {
    /// Resolve the client secret (expands `env:VAR`)
    #[must_use]
    pub fn resolve_client_secret(&self) -> Option<String> {
        self.client_secret
            .as_deref()
            .map(resolve_secret)
            .filter(|secret| !secret.is_empty())
    }
}

/// Calendar API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Base URL of the calendar REST API
    pub api_base: String,
    /// Calendar to read from and write to
    pub calendar_id: String,
    /// Maximum number of upcoming events returned
    pub max_results: u32,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            api_base: "https://www.googleapis.com/calendar/v3".to_string(),
            calendar_id: "primary".to_string(),
            max_results: 10,
        }
    }
}

/// Credential storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one credential file per user
    pub directory: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("tokens"),
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional YAML file and
    /// `CONSENT_BROKER_*` environment variables (nested with `__`).
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("CONSENT_BROKER_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Check that everything needed to serve requests is present.
    ///
    /// # Errors
    ///
    /// Returns the first missing or malformed setting.
    pub fn validate(&self) -> Result<()> {
        if self.auth.resolve_bearer_token().is_none() {
            return Err(Error::Config(
                "Service bearer token is not set (AUTH_TOKEN)".to_string(),
            ));
        }
        if self.provider.client_id.as_deref().is_none_or(str::is_empty) {
            return Err(Error::Config(
                "OAuth client id is not set (GOOGLE_CLIENT_ID)".to_string(),
            ));
        }
        if self.provider.resolve_client_secret().is_none() {
            return Err(Error::Config(
                "OAuth client secret is not set (GOOGLE_CLIENT_SECRET)".to_string(),
            ));
        }
        self.redirect_uri()?;
        Url::parse(&self.provider.authorization_endpoint)
            .map_err(|e| Error::Config(format!("Invalid authorization endpoint: {e}")))?;
        Url::parse(&self.provider.token_endpoint)
            .map_err(|e| Error::Config(format!("Invalid token endpoint: {e}")))?;
        if !self.provider.callback_path.starts_with('/') {
            return Err(Error::Config(format!(
                "Callback path must start with '/': {}",
                self.provider.callback_path
            )));
        }
        Ok(())
    }

    /// OAuth redirect URI: the public base URL followed by the callback path
    ///
    /// # Errors
    ///
    /// Returns an error if the public URL is unset or not a valid URL.
    pub fn redirect_uri(&self) -> Result<String> {
        let base = self
            .server
            .public_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                Error::Config("Public base URL is not set (SERVER_DOMAIN)".to_string())
            })?;
        let uri = format!(
            "{}{}",
            base.trim_end_matches('/'),
            self.provider.callback_path
        );
        Url::parse(&uri).map_err(|e| Error::Config(format!("Invalid public URL {base}: {e}")))?;
        Ok(uri)
    }
}

/// Expand `env:VAR_NAME` references; other values are returned as-is.
/// An unset variable resolves to an empty string so validation catches it.
#[must_use]
pub fn resolve_secret(value: &str) -> String {
    match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name).unwrap_or_default(),
        None => value.to_string(),
    }
}
