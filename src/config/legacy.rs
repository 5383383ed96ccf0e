//! The legacy (pre-versioning) config shape.
//!
//! A document without a `version` field is validated against this shape and
//! then migrated to v1; the rest of the crate never sees legacy types.

use serde_yaml::Value;

use crate::config::normalize::{BasicAuthUser, DEFAULT_FAKE_NGINX_VERSION};
use crate::config::schema::{self, SchemaError, SchemaErrors};
use crate::config::v1::{self, AllowPathV1, ConfigV1, RejectionV1};

/// A validated legacy config document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyConfig {
    /// `basicAuthUsers` entries, if any.
    pub basic_auth_users: Option<Vec<BasicAuthUser>>,
    /// `allowPaths` entries. Required in the legacy shape.
    pub allow_paths: Vec<LegacyAllowPath>,
    /// `rejection` setting. Required in the legacy shape.
    pub rejection: LegacyRejection,
}

/// One legacy `allowPaths` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyAllowPath {
    /// A plain string entry (exact match).
    Exact(String),
    /// A `{type: regexp, value: ...}` entry.
    Regexp(String),
}

/// The legacy `rejection` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyRejection {
    /// `socket-close`.
    SocketClose,
    /// `nginx-down`, bare or with an explicit `nginxVersion`.
    NginxDown {
        /// Version from the object form; `None` for the bare literal.
        nginx_version: Option<String>,
    },
}

/// Validates a document against the legacy shape, collecting every error.
pub fn parse(doc: &Value) -> Result<LegacyConfig, SchemaErrors> {
    let mut errors = Vec::new();

    let basic_auth_users = match schema::get(doc, "basicAuthUsers") {
        None => None,
        Some(value) => match v1::parse_basic_auth_users(value, "basicAuthUsers") {
            Ok(users) => Some(users),
            Err(mut user_errors) => {
                errors.append(&mut user_errors);
                None
            }
        },
    };

    let allow_paths = match schema::require(doc, "allowPaths", "") {
        Ok(value) => match parse_allow_paths(value) {
            Ok(paths) => Some(paths),
            Err(mut path_errors) => {
                errors.append(&mut path_errors);
                None
            }
        },
        Err(err) => {
            errors.push(err);
            None
        }
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

    match (allow_paths, rejection) {
        (Some(allow_paths), Some(rejection)) if errors.is_empty() => Ok(LegacyConfig {
            basic_auth_users,
            allow_paths,
            rejection,
        }),
        _ => Err(SchemaErrors(errors)),
    }
}

fn parse_allow_paths(value: &Value) -> Result<Vec<LegacyAllowPath>, Vec<SchemaError>> {
    let entries = schema::as_sequence(value, "allowPaths").map_err(|e| vec![e])?;
    let mut paths = Vec::with_capacity(entries.len());
    let mut errors = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let path = schema::element("allowPaths", index);
        match parse_allow_path(entry, &path) {
            Ok(allow_path) => paths.push(allow_path),
            Err(err) => errors.push(err),
        }
    }
    if errors.is_empty() { Ok(paths) } else { Err(errors) }
}

fn parse_allow_path(value: &Value, path: &str) -> Result<LegacyAllowPath, SchemaError> {
    if let Some(exact) = value.as_str() {
        return Ok(LegacyAllowPath::Exact(exact.to_string()));
    }
    let object_candidate = (|| {
        schema::as_mapping(value, path)?;
        let type_value = schema::require(value, "type", path)?;
        schema::expect_literal(type_value, "regexp", &schema::child(path, "type"))?;
        let pattern = schema::require_str(value, "value", path)?;
        Ok(LegacyAllowPath::Regexp(pattern.to_string()))
    })();
    object_candidate.map_err(|object_err| {
        SchemaError::no_variant(
            path,
            vec![SchemaError::expected(path, "string", value), object_err],
        )
    })
}

fn parse_rejection(value: &Value, path: &str) -> Result<LegacyRejection, SchemaError> {
    if let Some(literal) = value.as_str() {
        return match literal {
            "socket-close" => Ok(LegacyRejection::SocketClose),
            "nginx-down" => Ok(LegacyRejection::NginxDown {
                nginx_version: None,
            }),
            other => Err(SchemaError::no_variant(
                path,
                vec![
                    SchemaError::invalid_literal(path, "socket-close", other),
                    SchemaError::invalid_literal(path, "nginx-down", other),
                ],
            )),
        };
    }
    let object_candidate = (|| {
        schema::as_mapping(value, path)?;
        let type_value = schema::require(value, "type", path)?;
        schema::expect_literal(type_value, "nginx-down", &schema::child(path, "type"))?;
        let version = schema::require_str(value, "nginxVersion", path)?;
        Ok(LegacyRejection::NginxDown {
            nginx_version: Some(version.to_string()),
        })
    })();
    object_candidate.map_err(|object_err| {
        SchemaError::no_variant(
            path,
            vec![SchemaError::expected(path, "string", value), object_err],
        )
    })
}

impl LegacyConfig {
    /// Migrates to the v1 shape. Total: never fails on a validated legacy
    /// config. The bare `nginx-down` literal becomes the explicit object
    /// form carrying the default version, so migrated files are
    /// self-describing.
    pub fn into_v1(self) -> ConfigV1 {
        let allow_paths = self
            .allow_paths
            .into_iter()
            .map(|path| match path {
                LegacyAllowPath::Exact(value) => AllowPathV1::Path(value),
                LegacyAllowPath::Regexp(value) => AllowPathV1::Regexp(value),
            })
            .collect();
        let rejection = match self.rejection {
            LegacyRejection::SocketClose => RejectionV1::SocketClose,
            LegacyRejection::NginxDown { nginx_version } => RejectionV1::FakeNginxDownVersion {
                nginx_version: nginx_version
                    .unwrap_or_else(|| DEFAULT_FAKE_NGINX_VERSION.to_string()),
            },
        };
        ConfigV1 {
            basic_auth_users: self.basic_auth_users,
            allow_paths: Some(allow_paths),
            rejection,
            experimental_openid_connect: false,
            openid_connect: None,
        }
    }
}
