//! Browser side of the consent flow
//!
//! `/auth` sends the browser to the provider's consent screen with a fresh
//! state nonce; `/auth/callback` receives the authorization code, checks the
//! nonce and stores the resulting tokens.

use std::sync::Arc;

use axum::http::StatusCode;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::client::OAuthProvider;
use super::lifecycle::TokenManager;
use super::state::OAuthStateStore;
use crate::Result;

/// Body returned once the tokens are stored
pub const SUCCESS_MESSAGE: &str = "You can close the tab.";
/// Body returned for a callback without code or state
pub const INVALID_PARAMS_MESSAGE: &str = "Invalid OAuth callback parameters";
/// Body returned for an unknown, replayed or expired state
pub const INVALID_STATE_MESSAGE: &str = "Invalid or expired state parameter";
/// Body returned when the exchange or the save fails
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred.";

/// OAuth callback query parameters
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter (for CSRF protection)
    pub state: Option<String>,

    /// Error code reported by the provider
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

/// Consent redirect and callback handling for all users
pub struct ConsentFlow {
    states: OAuthStateStore,
    provider: Arc<dyn OAuthProvider>,
    tokens: Arc<TokenManager>,
}

impl ConsentFlow {
    /// Create a consent flow over the given provider and token manager
    pub fn new(
        states: OAuthStateStore,
        provider: Arc<dyn OAuthProvider>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            states,
            provider,
            tokens,
        }
    }

    /// Start consent for `user_id`: issue a state and build the consent URL
    pub fn begin(&self, user_id: &str) -> Result<String> {
        let state = self.states.issue(user_id);
        let url = self.provider.consent_url(&state)?;
        info!(user_id = %user_id, "Redirecting to provider consent screen");
        Ok(url)
    }

    /// Finish consent from the provider's redirect back to us
    pub async fn complete(&self, params: CallbackParams) -> (StatusCode, String) {
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());

        if let Some(err) = non_empty(params.error) {
            // The state is left in place; it expires on its own.
            warn!(
                error = %err,
                description = params.error_description.as_deref().unwrap_or(""),
                "Provider reported an OAuth error"
            );
            return (StatusCode::BAD_REQUEST, format!("OAuth Error: {err}"));
        }

        let (Some(code), Some(state)) = (non_empty(params.code), non_empty(params.state)) else {
            debug!("OAuth callback without code or state");
            return (StatusCode::BAD_REQUEST, INVALID_PARAMS_MESSAGE.to_string());
        };

        let user_id = match self.states.consume(&state) {
            Ok(user_id) => user_id,
            Err(_) => return (StatusCode::BAD_REQUEST, INVALID_STATE_MESSAGE.to_string()),
        };

        let grant = match self.provider.exchange_code(&code).await {
            Ok(grant) => grant,
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Authorization code exchange failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL_ERROR_MESSAGE.to_string(),
                );
            }
        };

        if let Err(e) = self.tokens.store_grant(&user_id, &grant) {
            error!(user_id = %user_id, error = %e, "Failed to store credentials");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                INTERNAL_ERROR_MESSAGE.to_string(),
            );
        }

        info!(user_id = %user_id, "Consent completed");
        (StatusCode::OK, SUCCESS_MESSAGE.to_string())
    }
}
