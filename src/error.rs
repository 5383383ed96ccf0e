//! Error types for the piping gateway.

use crate::config::schema::SchemaErrors;

/// Convenient result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors that the gateway can produce.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The config document does not have an accepted shape. Carries the
    /// structured error tree so callers can render per-leaf hints.
    #[error("config schema error: {0}")]
    ConfigShape(SchemaErrors),

    /// The config document is well-formed but not acceptable, e.g. an
    /// `openid_connect` block without the experimental opt-in flag.
    #[error("config policy error: {0}")]
    ConfigPolicy(String),

    /// Filesystem errors (config file reads, watcher setup).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not parseable YAML at all.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP errors talking to the OIDC provider.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// OIDC protocol failures (discovery, token exchange, userinfo).
    #[error("openid connect error: {0}")]
    Oidc(String),

    /// The upstream piping server could not be reached or misbehaved.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Watcher and other internal failures.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates an OIDC protocol error.
    pub fn oidc(msg: impl Into<String>) -> Self {
        Self::Oidc(msg.into())
    }

    /// Creates an upstream error.
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Creates an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True when the error comes from config validation (shape or policy),
    /// i.e. the kind of error a reload should survive.
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigShape(_) | Self::ConfigPolicy(_))
    }
}
