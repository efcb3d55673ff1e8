//! Consent Broker Library
//!
//! OAuth2 authorization broker between a multi-user agent host and a
//! calendar provider.
//!
//! # Features
//!
//! - **Two-layer gate**: service bearer secret for host calls, per-user
//!   tickets for the browser consent redirect
//! - **Token lifecycle**: durable per-user credentials, refreshed 60 seconds
//!   before expiry
//! - **Consent flow**: single-use state nonces bind each callback to the user
//!   who started it
//! - **MCP tools**: `view_calendar` and `add_event_to_calendar`, answering
//!   `[AUTH] <ticket>` when the user has to authorize first

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod calendar;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod protocol;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
    }
}
