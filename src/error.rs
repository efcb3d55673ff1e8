//! Error types for the consent broker

use std::io;

use thiserror::Error;

/// Result type alias for the consent broker
pub type Result<T> = std::result::Result<T, Error>;

/// Consent broker errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing or invalid settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential store could not read or write a record
    #[error("Storage error: {0}")]
    Storage(String),

    /// Provider rejected a request or returned an unusable response
    #[error("Provider error: {0}")]
    Provider(String),

    /// OAuth state nonce missing, forged or expired
    #[error("Invalid OAuth state: {0}")]
    InvalidState(String),

    /// Tool name not offered by this server
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Tool arguments failed validation
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error talking to the provider
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::InvalidArguments(_) => rpc_codes::INVALID_PARAMS,
            Self::UnknownTool(_) => rpc_codes::METHOD_NOT_FOUND,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// Whether this error came from talking to the provider
    #[must_use]
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::Http(_))
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
}
