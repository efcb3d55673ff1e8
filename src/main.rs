//! Consent Broker - OAuth consent and token broker for multi-user calendar tools

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use consent_broker::{
    cli::{Cli, Command},
    config::Config,
    gateway::Broker,
    oauth::CredentialStore,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    // .env is optional; real environment variables take precedence
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            cli.apply_overrides(&mut config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Status { ref user_id }) => run_status(&config, user_id),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Report stored credential state for one user without contacting the provider
fn run_status(config: &Config, user_id: &str) -> ExitCode {
    let store = match CredentialStore::new(&config.storage.directory) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to open credential store: {e}");
            return ExitCode::FAILURE;
        }
    };

    match store.load(user_id) {
        Some(record) => {
            println!("User:        {user_id}");
            println!("Record:      {}", store.record_path(user_id).display());
            println!("Expires at:  {}", record.expires_at);
            println!(
                "Access:      {}",
                if record.is_fresh() { "fresh" } else { "needs refresh" }
            );
            println!(
                "Refresh:     {}",
                if record.refresh_token.is_empty() {
                    "missing (re-consent required once expired)"
                } else {
                    "present"
                }
            );
            ExitCode::SUCCESS
        }
        None => {
            println!("No stored credentials for {user_id}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> ExitCode {
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting consent broker"
    );

    let broker = match Broker::new(config) {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to create broker: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = broker.run().await {
        error!("Broker error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Broker shutdown complete");
    ExitCode::SUCCESS
}
