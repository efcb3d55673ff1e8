//! MCP protocol types used on the host-facing `/mcp` endpoint

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// Protocol version offered when the client asks for one we do not know
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions this server can speak, newest first
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Pick the protocol version for a session: the client's if we support it,
/// otherwise our newest
#[must_use]
pub fn negotiate_version(client_version: &str) -> &'static str {
    SUPPORTED_VERSIONS
        .iter()
        .copied()
        .find(|v| *v == client_version)
        .unwrap_or(PROTOCOL_VERSION)
}
