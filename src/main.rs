//! Piping gateway - authenticating reverse gateway for Piping Server
//!
//! Fronts an unauthenticated Piping Server with basic auth, path
//! allow-lists, OpenID Connect, and hot-reloaded YAML config.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use piping_gateway::{
    cli::{Cli, Command},
    config::{self, MigrationOutcome},
    config_ref::ConfigRef,
    config_watch,
    gateway::{AppState, GatewayServer},
    oidc::{PendingAuthStore, SessionStore},
    relay::ProxyRelay,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::MigrateConfig) => run_migrate_config(&cli).await,
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    let Some(upstream) = cli.upstream else {
        error!("--upstream is required to serve");
        return ExitCode::FAILURE;
    };

    let relay = match ProxyRelay::new(&upstream) {
        Ok(relay) => relay,
        Err(e) => {
            error!("Invalid upstream: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %cli.host,
        port = cli.port,
        upstream = %upstream,
        "Starting piping gateway"
    );

    // A broken config file at startup is not fatal: the gateway comes up
    // closing every connection and picks up the next valid edit.
    let config_ref = ConfigRef::new();
    config_watch::reload_once(&cli.config_path, &config_ref).await;

    let state = Arc::new(AppState {
        config_ref,
        sessions: SessionStore::new(),
        pending: PendingAuthStore::new(),
        relay: Arc::new(relay),
    });

    let server = GatewayServer::new(cli.host, cli.port, Some(cli.config_path), state);
    if let Err(e) = server.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}

/// Run the migrate-config command
async fn run_migrate_config(cli: &Cli) -> ExitCode {
    let text = match tokio::fs::read_to_string(&cli.config_path).await {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Failed to read {}: {e}", cli.config_path.display());
            return ExitCode::FAILURE;
        }
    };

    let doc: serde_yaml::Value = match serde_yaml::from_str(&text) {
        Ok(doc) => doc,
        Err(e) => {
            eprintln!("Failed to parse YAML: {e}");
            return ExitCode::FAILURE;
        }
    };

    match config::migrate_document(&doc) {
        Ok(MigrationOutcome::AlreadyV1) => {
            println!("The config is already a valid config v1");
            ExitCode::SUCCESS
        }
        Ok(MigrationOutcome::Migrated(v1)) => match serde_yaml::to_string(&v1.to_document()) {
            Ok(yaml) => {
                println!("{yaml}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to serialize migrated config: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            if let piping_gateway::Error::ConfigShape(errors) = &e {
                for leaf in errors.leaves() {
                    eprintln!("config error hint: {}", leaf.to_hint());
                }
            } else {
                eprintln!("{e}");
            }
            ExitCode::FAILURE
        }
    }
}
