//! Pending consent redirects keyed by their OAuth `state` nonce.
//!
//! A nonce is issued when `/auth` redirects a browser to the consent screen
//! and consumed exactly once when the callback arrives. Anything else
//! (unknown, replayed or expired nonces) is rejected.

use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, warn};

use crate::{Error, Result};

/// A consent redirect waiting for its callback
#[derive(Debug, Clone)]
struct PendingConsent {
    user_id: String,
    created_at: Instant,
}

/// Process-scoped store of outstanding OAuth state nonces
#[derive(Debug)]
pub struct OAuthStateStore {
    pending: DashMap<String, PendingConsent>,
    ttl: Duration,
}

impl OAuthStateStore {
    /// Create an empty store whose nonces expire after `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
        }
    }

    /// Issue a fresh nonce bound to `user_id`
    pub fn issue(&self, user_id: &str) -> String {
        self.prune_expired();

        let state = generate_state();
        self.pending.insert(
            state.clone(),
            PendingConsent {
                user_id: user_id.to_string(),
                created_at: Instant::now(),
            },
        );
        debug!(user_id = %user_id, pending = self.pending.len(), "Issued OAuth state");
        state
    }

    /// Remove a nonce and return the user it was issued for.
    ///
    /// The nonce is gone after this call whether or not it was still valid.
    pub fn consume(&self, state: &str) -> Result<String> {
        let Some((_, pending)) = self.pending.remove(state) else {
            warn!("Unknown or replayed OAuth state, possible forged callback");
            return Err(Error::InvalidState("unknown or already used".to_string()));
        };

        if pending.created_at.elapsed() > self.ttl {
            warn!(user_id = %pending.user_id, "Expired OAuth state");
            return Err(Error::InvalidState("expired".to_string()));
        }

        Ok(pending.user_id)
    }

    /// Number of outstanding nonces
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no nonces are outstanding
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn prune_expired(&self) {
        let ttl = self.ttl;
        self.pending.retain(|_, p| p.created_at.elapsed() <= ttl);
    }
}

/// Generate a random state parameter
fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}
