//! The normalized runtime config.
//!
//! Every request-time component reads this flat, tagged shape instead of the
//! versioned on-disk unions. Produced exclusively by [`normalize`], which is
//! only reachable from a schema-valid [`ConfigV1`].

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::config::v1::{AllowPathV1, ConfigV1, RejectionV1};

/// Version string served by the fake nginx page when none is configured.
pub const DEFAULT_FAKE_NGINX_VERSION: &str = "1.17.8";

/// One basic-auth credential pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuthUser {
    /// Username compared against the Basic credential.
    pub username: String,
    /// Password compared against the Basic credential.
    pub password: String,
}

/// One allow-path rule, evaluated in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowPath {
    /// Exact match on the raw request target (path plus query).
    Path(String),
    /// Regular expression searched anywhere in the raw request target.
    Regexp(String),
    /// Prefix match; on match the prefix is stripped before relaying.
    Index(String),
}

/// What to do with a request whose path is not allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Close the TCP connection without writing any HTTP bytes.
    SocketClose,
    /// Serve a synthetic nginx 500 page carrying the given version string.
    FakeNginxDown {
        /// Version echoed in the `Server` header and page footer.
        nginx_version: String,
    },
}

/// The flat config consumed by the request pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedConfig {
    /// Basic-auth users; absent means the basic-auth gate is skipped.
    pub basic_auth_users: Option<Vec<BasicAuthUser>>,
    /// Allow-path rules; absent means every path is allowed. An empty list
    /// is kept as an empty list and rejects everything.
    pub allow_paths: Option<Vec<AllowPath>>,
    /// Behavior for rejected paths.
    pub rejection: Rejection,
    /// OpenID Connect settings; present only when the experimental flag
    /// opted in at load time.
    pub openid_connect: Option<OidcConfig>,
}

// ==== OpenID Connect block ====
//
// This block has a fixed shape with no unions that need per-candidate
// diagnostics, so it is plain serde.

/// OpenID Connect settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidcConfig {
    /// Provider issuer URL, used for discovery.
    pub issuer_url: String,
    /// OAuth2 client id registered with the provider.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// Where the provider sends the user back.
    pub redirect: OidcRedirect,
    /// Identities allowed through the gateway. An empty list denies everyone.
    pub allow_userinfos: Vec<AllowUserinfo>,
    /// Session issuance and transport settings.
    pub session: OidcSession,
    /// Optional logging of identity claims on session creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<OidcLog>,
}

/// The registered redirect target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidcRedirect {
    /// Full redirect URI sent to the provider.
    pub uri: String,
    /// Local path that serves the callback, matched against request paths.
    pub path: String,
}

/// One allow-list entry. `sub` entries win over `email` entries when an
/// entry carries both keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowUserinfo {
    /// Allow an exact subject.
    Sub {
        /// The `sub` claim to match.
        sub: String,
    },
    /// Allow an exact email address.
    Email {
        /// The `email` claim to match.
        email: String,
        /// When explicitly `false`, skip the `email_verified` requirement.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        require_verification: Option<bool>,
    },
}

/// Session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidcSession {
    /// Session lifetime in seconds. Applies retroactively to live sessions
    /// on config reload.
    pub age_seconds: u64,
    /// Optional request header that may carry a session id (for non-browser
    /// clients that cannot use cookies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_http_header: Option<String>,
    /// Optional session-forward handoff settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<OidcSessionForward>,
    /// Session cookie settings.
    pub cookie: OidcCookie,
}

/// Session-forward handoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidcSessionForward {
    /// Query parameter whose value is the forward target URL.
    pub query_param_name: String,
    /// Regexp the forward target must match. The only defense against
    /// handing a session id to an attacker-chosen origin.
    pub allow_url_regexp: String,
}

/// Session cookie settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidcCookie {
    /// Cookie name.
    pub name: String,
    /// Whether to mark the cookie `HttpOnly`.
    pub http_only: bool,
}

/// Claim-logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidcLog {
    /// Which claims to log when a session is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo: Option<OidcLogUserinfo>,
}

/// Which identity claims to include in session-creation log lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidcLogUserinfo {
    /// Log the `sub` claim.
    pub sub: bool,
    /// Log the `email` claim.
    pub email: bool,
}

/// Flattens a v1 config into the runtime shape.
///
/// Fails with a policy error (not a shape error) when `openid_connect` is
/// present without `experimental_openid_connect: true`. The absent-vs-empty
/// distinction of `allow_paths` is preserved exactly.
pub fn normalize(config: ConfigV1) -> crate::Result<NormalizedConfig> {
    if config.openid_connect.is_some() && !config.experimental_openid_connect {
        return Err(Error::ConfigPolicy(
            "openid_connect is specified but experimental_openid_connect is not true".to_string(),
        ));
    }
    let allow_paths = config.allow_paths.map(|paths| {
        paths
            .into_iter()
            .map(|path| match path {
                AllowPathV1::Path(value) => AllowPath::Path(value),
                AllowPathV1::Regexp(value) => AllowPath::Regexp(value),
                AllowPathV1::Index(value) => AllowPath::Index(value),
            })
            .collect()
    });
    let rejection = match config.rejection {
        RejectionV1::SocketClose | RejectionV1::SocketCloseTyped => Rejection::SocketClose,
        RejectionV1::FakeNginxDown => Rejection::FakeNginxDown {
            nginx_version: DEFAULT_FAKE_NGINX_VERSION.to_string(),
        },
        RejectionV1::FakeNginxDownVersion { nginx_version } => {
            Rejection::FakeNginxDown { nginx_version }
        }
    };
    Ok(NormalizedConfig {
        basic_auth_users: config.basic_auth_users,
        allow_paths,
        rejection,
        openid_connect: config.openid_connect,
    })
}
