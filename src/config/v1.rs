//! The version-1 config shape.
//!
//! A strict superset of the legacy shape: adds `index` allow paths, the
//! object `fake_nginx_down` rejection, and the gated OpenID Connect block.

use serde_yaml::{Mapping, Value};

use crate::config::normalize::{BasicAuthUser, OidcConfig};
use crate::config::schema::{self, SchemaError, SchemaErrors};

/// A validated v1 config document.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigV1 {
    /// `basic_auth_users` entries, if any.
    pub basic_auth_users: Option<Vec<BasicAuthUser>>,
    /// `allow_paths` entries; absent means every path is allowed.
    pub allow_paths: Option<Vec<AllowPathV1>>,
    /// `rejection` setting. Required.
    pub rejection: RejectionV1,
    /// The `experimental_openid_connect` opt-in flag.
    pub experimental_openid_connect: bool,
    /// The `openid_connect` block, parsed but not yet policy-checked.
    pub openid_connect: Option<OidcConfig>,
}

/// One v1 `allow_paths` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowPathV1 {
    /// A plain string entry (exact match).
    Path(String),
    /// A `{regexp: ...}` entry.
    Regexp(String),
    /// An `{index: ...}` entry (prefix match with rewrite).
    Index(String),
}

/// The v1 `rejection` setting, keeping each accepted spelling distinct so
/// `migrate-config` output can be reasoned about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionV1 {
    /// The `socket_close` literal.
    SocketClose,
    /// The `{type: socket_close}` object form.
    SocketCloseTyped,
    /// The bare `fake_nginx_down` literal (default version at runtime).
    FakeNginxDown,
    /// The `{fake_nginx_down: {nginx_version: ...}}` object form.
    FakeNginxDownVersion {
        /// The configured version string.
        nginx_version: String,
    },
}

/// Validates a document against the v1 shape, collecting every error.
/// The `version` field itself is checked by the caller's version detection.
pub fn parse(doc: &Value) -> Result<ConfigV1, SchemaErrors> {
    let mut errors = Vec::new();

    match schema::require(doc, "config_for", "") {
        Ok(value) => {
            if let Err(err) = schema::expect_literal(value, "rich_piping_server", "config_for") {
                errors.push(err);
            }
        }
        Err(err) => errors.push(err),
    }

    let basic_auth_users = match schema::get(doc, "basic_auth_users") {
        None => None,
        Some(value) => match parse_basic_auth_users(value, "basic_auth_users") {
            Ok(users) => Some(users),
            Err(mut user_errors) => {
                errors.append(&mut user_errors);
                None
            }
        },
    };

    let allow_paths = match schema::get(doc, "allow_paths") {
        None => None,
        Some(value) => match parse_allow_paths(value) {
            Ok(paths) => Some(paths),
            Err(mut path_errors) => {
                errors.append(&mut path_errors);
                None
            }
        },
    };

    let rejection = match schema::require(doc, "rejection", "") {
        Ok(value) => match parse_rejection(value, "rejection") {
            Ok(rejection) => Some(rejection),
            Err(err) => {
                errors.push(err);
                None
            }
        },
        Err(err) => {
            errors.push(err);
            None
        }
    };

    let experimental_openid_connect = match schema::get(doc, "experimental_openid_connect") {
        None => false,
        Some(value) => match schema::as_bool(value, "experimental_openid_connect") {
            Ok(flag) => flag,
            Err(err) => {
                errors.push(err);
                false
            }
        },
    };

    // The OIDC block has a fixed shape, so its validation is delegated to
    // serde; a failure becomes one leaf under `openid_connect`.
    let openid_connect = match schema::get(doc, "openid_connect") {
        None => None,
        Some(value) => match serde_yaml::from_value::<OidcConfig>(value.clone()) {
            Ok(config) => Some(config),
            Err(err) => {
                errors.push(SchemaError::invalid("openid_connect", err.to_string()));
                None
            }
        },
    };

    match rejection {
        Some(rejection) if errors.is_empty() => Ok(ConfigV1 {
            basic_auth_users,
            allow_paths,
            rejection,
            experimental_openid_connect,
            openid_connect,
        }),
        _ => Err(SchemaErrors(errors)),
    }
}

/// Parses a `[{username, password}]` list. Shared with the legacy shape,
/// which uses the same entry layout under a different field name.
pub(crate) fn parse_basic_auth_users(
    value: &Value,
    path: &str,
) -> Result<Vec<BasicAuthUser>, Vec<SchemaError>> {
    let entries = schema::as_sequence(value, path).map_err(|e| vec![e])?;
    let mut users = Vec::with_capacity(entries.len());
    let mut errors = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let entry_path = schema::element(path, index);
        if let Err(err) = schema::as_mapping(entry, &entry_path) {
            errors.push(err);
            continue;
        }
        let username = match schema::require_str(entry, "username", &entry_path) {
            Ok(username) => Some(username.to_string()),
            Err(err) => {
                errors.push(err);
                None
            }
        };
        let password = match schema::require_str(entry, "password", &entry_path) {
            Ok(password) => Some(password.to_string()),
            Err(err) => {
                errors.push(err);
                None
            }
        };
        if let (Some(username), Some(password)) = (username, password) {
            users.push(BasicAuthUser { username, password });
        }
    }
    if errors.is_empty() { Ok(users) } else { Err(errors) }
}

fn parse_allow_paths(value: &Value) -> Result<Vec<AllowPathV1>, Vec<SchemaError>> {
    let entries = schema::as_sequence(value, "allow_paths").map_err(|e| vec![e])?;
    let mut paths = Vec::with_capacity(entries.len());
    let mut errors = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let path = schema::element("allow_paths", index);
        match parse_allow_path(entry, &path) {
            Ok(allow_path) => paths.push(allow_path),
            Err(err) => errors.push(err),
        }
    }
    if errors.is_empty() { Ok(paths) } else { Err(errors) }
}

fn parse_allow_path(value: &Value, path: &str) -> Result<AllowPathV1, SchemaError> {
    if let Some(exact) = value.as_str() {
        return Ok(AllowPathV1::Path(exact.to_string()));
    }
    if value.is_mapping() {
        // Dispatch on the present key so inner errors keep a precise path.
        if schema::get(value, "regexp").is_some() {
            let pattern = schema::require_str(value, "regexp", path)?;
            return Ok(AllowPathV1::Regexp(pattern.to_string()));
        }
        if schema::get(value, "index").is_some() {
            let prefix = schema::require_str(value, "index", path)?;
            return Ok(AllowPathV1::Index(prefix.to_string()));
        }
    }
    Err(SchemaError::no_variant(
        path,
        vec![
            SchemaError::expected(path, "string", value),
            SchemaError::missing(path, "regexp"),
            SchemaError::missing(path, "index"),
        ],
    ))
}

fn parse_rejection(value: &Value, path: &str) -> Result<RejectionV1, SchemaError> {
    if let Some(literal) = value.as_str() {
        return match literal {
            "socket_close" => Ok(RejectionV1::SocketClose),
            "fake_nginx_down" => Ok(RejectionV1::FakeNginxDown),
            other => Err(SchemaError::no_variant(
                path,
                vec![
                    SchemaError::invalid_literal(path, "socket_close", other),
                    SchemaError::invalid_literal(path, "fake_nginx_down", other),
                ],
            )),
        };
    }
    if value.is_mapping() {
        if schema::get(value, "type").is_some() {
            let type_value = schema::require(value, "type", path)?;
            schema::expect_literal(type_value, "socket_close", &schema::child(path, "type"))?;
            return Ok(RejectionV1::SocketCloseTyped);
        }
        if let Some(inner) = schema::get(value, "fake_nginx_down") {
            let inner_path = schema::child(path, "fake_nginx_down");
            schema::as_mapping(inner, &inner_path)?;
            let version = schema::require_str(inner, "nginx_version", &inner_path)?;
            return Ok(RejectionV1::FakeNginxDownVersion {
                nginx_version: version.to_string(),
            });
        }
    }
    Err(SchemaError::no_variant(
        path,
        vec![
            SchemaError::expected(path, "string", value),
            SchemaError::missing(path, "type"),
            SchemaError::missing(path, "fake_nginx_down"),
        ],
    ))
}

impl ConfigV1 {
    /// Renders this config back to a YAML document, used by the
    /// `migrate-config` command to print the migrated file.
    pub fn to_document(&self) -> Value {
        let mut doc = Mapping::new();
        doc.insert("version".into(), "1".into());
        doc.insert("config_for".into(), "rich_piping_server".into());
        if let Some(users) = &self.basic_auth_users {
            let rendered: Vec<Value> = users
                .iter()
                .map(|user| {
                    let mut entry = Mapping::new();
                    entry.insert("username".into(), user.username.clone().into());
                    entry.insert("password".into(), user.password.clone().into());
                    Value::Mapping(entry)
                })
                .collect();
            doc.insert("basic_auth_users".into(), Value::Sequence(rendered));
        }
        if let Some(paths) = &self.allow_paths {
            let rendered: Vec<Value> = paths
                .iter()
                .map(|path| match path {
                    AllowPathV1::Path(value) => Value::from(value.clone()),
                    AllowPathV1::Regexp(value) => {
                        let mut entry = Mapping::new();
                        entry.insert("regexp".into(), value.clone().into());
                        Value::Mapping(entry)
                    }
                    AllowPathV1::Index(value) => {
                        let mut entry = Mapping::new();
                        entry.insert("index".into(), value.clone().into());
                        Value::Mapping(entry)
                    }
                })
                .collect();
            doc.insert("allow_paths".into(), Value::Sequence(rendered));
        }
        let rejection = match &self.rejection {
            RejectionV1::SocketClose => Value::from("socket_close"),
            RejectionV1::SocketCloseTyped => {
                let mut entry = Mapping::new();
                entry.insert("type".into(), "socket_close".into());
                Value::Mapping(entry)
            }
            RejectionV1::FakeNginxDown => Value::from("fake_nginx_down"),
            RejectionV1::FakeNginxDownVersion { nginx_version } => {
                let mut inner = Mapping::new();
                inner.insert("nginx_version".into(), nginx_version.clone().into());
                let mut entry = Mapping::new();
                entry.insert("fake_nginx_down".into(), Value::Mapping(inner));
                Value::Mapping(entry)
            }
        };
        doc.insert("rejection".into(), rejection);
        if self.experimental_openid_connect {
            doc.insert("experimental_openid_connect".into(), true.into());
        }
        if let Some(oidc) = &self.openid_connect {
            let rendered = serde_yaml::to_value(oidc).unwrap_or(Value::Null);
            doc.insert("openid_connect".into(), rendered);
        }
        Value::Mapping(doc)
    }
}
