//! Command-line interface

use std::path::PathBuf;

use axum::http::Uri;
use clap::{Parser, Subcommand};

/// Authenticating, access-controlling gateway in front of a Piping Server
#[derive(Parser, Debug)]
#[command(name = "piping-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the gateway config file (YAML)
    #[arg(short, long, env = "PIPING_GATEWAY_CONFIG")]
    pub config_path: PathBuf,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "PIPING_GATEWAY_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "PIPING_GATEWAY_PORT")]
    pub port: u16,

    /// URL of the Piping Server upstream to relay to (required to serve)
    #[arg(long, env = "PIPING_GATEWAY_UPSTREAM")]
    pub upstream: Option<Uri>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "PIPING_GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "PIPING_GATEWAY_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Print the config migrated to v1, or report that it already is v1
    MigrateConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["piping-gateway", "--config-path", "conf.yaml"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config_path, PathBuf::from("conf.yaml"));
        assert_eq!(cli.host, "0.0.0.0");
        assert_eq!(cli.port, 8080);
        assert!(cli.upstream.is_none());
    }

    #[test]
    fn config_path_is_required() {
        assert!(Cli::try_parse_from(["piping-gateway"]).is_err());
    }

    #[test]
    fn upstream_parses_as_a_uri() {
        let cli = Cli::try_parse_from([
            "piping-gateway",
            "--config-path",
            "conf.yaml",
            "--upstream",
            "http://127.0.0.1:8181",
        ])
        .unwrap();
        let upstream = cli.upstream.unwrap();
        assert_eq!(upstream.authority().unwrap().as_str(), "127.0.0.1:8181");
    }

    #[test]
    fn migrate_config_subcommand_parses() {
        let cli = Cli::try_parse_from([
            "piping-gateway",
            "--config-path",
            "conf.yaml",
            "migrate-config",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Command::MigrateConfig)));
    }
}
