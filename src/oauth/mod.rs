//! OAuth 2.0 side of the broker
//!
//! - Credential storage with atomic per-user files
//! - Provider client for consent URLs, code exchange and refresh
//! - Token lifecycle with a 60 second expiry margin
//! - Single-use state nonces for the consent round trip

mod callback;
mod client;
mod lifecycle;
mod state;
mod storage;

pub use callback::{
    CallbackParams, ConsentFlow, INTERNAL_ERROR_MESSAGE, INVALID_PARAMS_MESSAGE,
    INVALID_STATE_MESSAGE, SUCCESS_MESSAGE,
};
pub use client::{OAuthProvider, ProviderClient, build_http_client};
pub use lifecycle::TokenManager;
pub use state::OAuthStateStore;
pub use storage::{CredentialRecord, CredentialStore, EXPIRY_MARGIN_SECS, TokenGrant};

#[cfg(test)]
pub(crate) use storage::unix_now;
