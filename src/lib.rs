//! Piping Gateway Library
//!
//! An authenticating, access-controlling reverse gateway that sits in front
//! of a [Piping Server](https://github.com/nwtgck/piping-server) style relay.
//!
//! # Features
//!
//! - **Path allow-lists**: exact, regexp, and prefix-stripping index entries
//! - **Basic auth**: constant-time credential checks against a config list
//! - **OpenID Connect**: authorization-code + PKCE login with in-memory
//!   sessions, allow-listed users, and optional session forwarding
//! - **Stealth rejection**: close the socket without a byte, or serve a
//!   byte-exact "nginx is down" page
//! - **Hot reload**: the YAML config is re-validated and swapped in on every
//!   file change; a bad edit never takes the gateway down
//!
//! The config file is accepted in two generations: the legacy versionless
//! shape and v1 (`version: "1"`). Legacy files are migrated in memory on
//! load, and `migrate-config` prints the migrated document.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod config_ref;
pub mod config_watch;
pub mod error;
pub mod gateway;
pub mod oidc;
pub mod relay;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
