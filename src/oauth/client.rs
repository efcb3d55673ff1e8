//! Provider OAuth Client
//!
//! Builds consent URLs, exchanges authorization codes and refreshes access
//! tokens against the provider's token endpoint. Every network call is a
//! single attempt: no retries, the caller restarts the flow on failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use super::storage::TokenGrant;
use crate::config::Config;
use crate::{Error, Result};

/// Operations the broker needs from an OAuth2 provider
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Consent screen URL carrying the given state nonce
    fn consent_url(&self, state: &str) -> Result<String>;

    /// Exchange an authorization code for tokens
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;

    /// Obtain a new access token from a refresh token
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

/// OAuth client for one provider application
#[derive(Debug, Clone)]
pub struct ProviderClient {
    /// HTTP client for token requests
    http_client: Client,
    /// Registered client id
    client_id: String,
    /// Registered client secret
    client_secret: String,
    /// Redirect URI registered with the provider
    redirect_uri: String,
    /// Consent screen endpoint
    authorization_endpoint: String,
    /// Token endpoint
    token_endpoint: String,
    /// Requested scopes
    scopes: Vec<String>,
}

impl ProviderClient {
    /// Create a client from explicit settings
    #[must_use]
    pub fn new(
        http_client: Client,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
        authorization_endpoint: String,
        token_endpoint: String,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            http_client,
            client_id,
            client_secret,
            redirect_uri,
            authorization_endpoint,
            token_endpoint,
            scopes,
        }
    }

    /// Create a client from validated configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let http_client = build_http_client(config.provider.request_timeout)?;
        let client_id = config
            .provider
            .client_id
            .clone()
            .ok_or_else(|| Error::Config("OAuth client id is not set".to_string()))?;
        let client_secret = config
            .provider
            .resolve_client_secret()
            .ok_or_else(|| Error::Config("OAuth client secret is not set".to_string()))?;

        Ok(Self::new(
            http_client,
            client_id,
            client_secret,
            config.redirect_uri()?,
            config.provider.authorization_endpoint.clone(),
            config.provider.token_endpoint.clone(),
            config.provider.scopes.clone(),
        ))
    }

    /// POST a form to the token endpoint and parse the grant
    async fn token_request(&self, params: &[(&str, &str)], action: &str) -> Result<TokenGrant> {
        let response = self
            .http_client
            .post(&self.token_endpoint)
            .form(params)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("{action} request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "{action} failed: HTTP {status} - {body}"
            )));
        }

        let grant: TokenGrant = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("Failed to parse {action} response: {e}")))?;

        if grant.access_token.is_empty() {
            return Err(Error::Provider(format!(
                "{action} response has no access token"
            )));
        }
        Ok(grant)
    }
}

#[async_trait]
impl OAuthProvider for ProviderClient {
    fn consent_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.authorization_endpoint)
            .map_err(|e| Error::Config(format!("Invalid authorization endpoint: {e}")))?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("client_id", &self.client_id);
            params.append_pair("redirect_uri", &self.redirect_uri);
            params.append_pair("response_type", "code");
            params.append_pair("scope", &self.scopes.join(" "));
            // Offline access plus a forced consent prompt makes the provider
            // issue a refresh token even for returning users.
            params.append_pair("access_type", "offline");
            params.append_pair("prompt", "consent");
            params.append_pair("state", state);
        }

        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        debug!("Exchanging authorization code");
        let grant = self
            .token_request(
                &[
                    ("code", code),
                    ("client_id", &self.client_id),
                    ("client_secret", &self.client_secret),
                    ("redirect_uri", &self.redirect_uri),
                    ("grant_type", "authorization_code"),
                ],
                "Token exchange",
            )
            .await?;
        info!(has_refresh_token = grant.refresh_token.is_some(), "Authorization code exchanged");
        Ok(grant)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let grant = self
            .token_request(
                &[
                    ("client_id", &self.client_id),
                    ("client_secret", &self.client_secret),
                    ("refresh_token", refresh_token),
                    ("grant_type", "refresh_token"),
                ],
                "Token refresh",
            )
            .await?;
        debug!("Access token refreshed");
        Ok(grant)
    }
}

/// HTTP client used for all provider calls
pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("consent-broker/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))
}
