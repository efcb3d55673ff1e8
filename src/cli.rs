//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// OAuth consent broker for multi-user calendar tools
#[derive(Parser, Debug)]
#[command(name = "consent-broker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CONSENT_BROKER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Service bearer secret shared with the host
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Externally reachable base URL of this service
    #[arg(long, env = "SERVER_DOMAIN")]
    pub server_domain: Option<String>,

    /// OAuth client id
    #[arg(long, env = "GOOGLE_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth client secret
    #[arg(long, env = "GOOGLE_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Directory for per-user credential files
    #[arg(long, env = "TOKEN_DIR", global = true)]
    pub token_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "CONSENT_BROKER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CONSENT_BROKER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the broker server (default)
    Serve,

    /// Show whether a user has stored credentials and whether they are fresh
    Status {
        /// User id as sent by the host
        user_id: String,
    },
}

impl Cli {
    /// Apply command-line and environment overrides on top of loaded config
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ref host) = self.host {
            config.server.host.clone_from(host);
        }
        if let Some(ref token) = self.auth_token {
            config.auth.bearer_token = Some(token.clone());
        }
        if let Some(ref domain) = self.server_domain {
            config.server.public_url = Some(domain.clone());
        }
        if let Some(ref id) = self.client_id {
            config.provider.client_id = Some(id.clone());
        }
        if let Some(ref secret) = self.client_secret {
            config.provider.client_secret = Some(secret.clone());
        }
        if let Some(ref dir) = self.token_dir {
            config.storage.directory.clone_from(dir);
        }
    }
}
