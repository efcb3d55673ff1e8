//! Token lifecycle: decide whether a user's stored access token can be used,
//! refresh it when it cannot, and report when consent has to start over.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::client::OAuthProvider;
use super::storage::{CredentialStore, TokenGrant};

/// Hands out usable provider access tokens per user
pub struct TokenManager {
    store: Arc<CredentialStore>,
    provider: Arc<dyn OAuthProvider>,
}

impl TokenManager {
    /// Create a manager over a credential store and provider
    pub fn new(store: Arc<CredentialStore>, provider: Arc<dyn OAuthProvider>) -> Self {
        Self { store, provider }
    }

    /// Credential store backing this manager
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Return a usable access token for `user_id`, refreshing it if it is
    /// stale. `None` means the user has to go through consent again.
    ///
    /// A single refresh attempt is made; failures are not retried. Two
    /// concurrent calls for the same user may both refresh, and the last
    /// write wins in the store.
    pub async fn get_user_token(&self, user_id: &str) -> Option<String> {
        let record = self.store.load(user_id)?;

        if record.is_fresh() {
            debug!(user_id = %user_id, "Using stored access token");
            return Some(record.access_token);
        }

        if record.refresh_token.is_empty() {
            warn!(user_id = %user_id, "Access token stale and no refresh token stored");
            return None;
        }

        let grant = match self.provider.refresh(&record.refresh_token).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Token refresh failed, consent required");
                return None;
            }
        };

        // Providers usually omit the refresh token on refresh responses.
        let grant = TokenGrant {
            refresh_token: grant.refresh_token.or(Some(record.refresh_token)),
            ..grant
        };

        if let Err(e) = self.store.save(user_id, &grant) {
            warn!(user_id = %user_id, error = %e, "Refreshed token could not be persisted");
        }
        info!(user_id = %user_id, "Access token refreshed");
        Some(grant.access_token)
    }

    /// Persist the tokens obtained from a completed consent
    pub fn store_grant(&self, user_id: &str, grant: &TokenGrant) -> crate::Result<()> {
        self.store.save(user_id, grant).map(|_| ())
    }
}
