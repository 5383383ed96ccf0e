//! Structural validation primitives for config documents.
//!
//! The config file is parsed into a generic [`serde_yaml::Value`] first and
//! then walked by hand. Hand-walking keeps full control over error paths and
//! lets union shapes (a value that may be a string or one of several object
//! forms) report every candidate's failure instead of a single opaque
//! mismatch. Errors form a tree; [`SchemaErrors::leaves`] flattens it for the
//! `config error hint:` diagnostics.

use serde_yaml::Value;

/// A single validation error, tagged with the document path it occurred at
/// (e.g. `allow_paths[2].value`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    /// Dotted/indexed path into the document. Empty for the document root.
    pub path: String,
    /// What went wrong at that path.
    pub kind: SchemaErrorKind,
}

/// The kinds of structural errors a config document can have.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaErrorKind {
    /// A value had the wrong type.
    #[error("expected {expected}, found {found}")]
    Expected {
        /// The type the schema wanted.
        expected: &'static str,
        /// The type actually present.
        found: String,
    },
    /// A required field was absent.
    #[error("missing required field")]
    MissingField {
        /// The absent field name.
        field: &'static str,
    },
    /// A field must hold one specific value and held something else.
    #[error("expected literal `{expected}`, found {found}")]
    InvalidLiteral {
        /// The required literal.
        expected: &'static str,
        /// What was found instead.
        found: String,
    },
    /// None of a union's candidate shapes matched. Keeps every candidate's
    /// own error so diagnostics can show all near-misses.
    #[error("no accepted shape matched")]
    NoVariant {
        /// One (or more) errors per failed candidate shape.
        candidates: Vec<SchemaError>,
    },
    /// A free-form error from a delegated sub-validator.
    #[error("{message}")]
    Invalid {
        /// The delegated validator's message.
        message: String,
    },
}

impl SchemaError {
    /// Wrong-type error at `path`.
    pub fn expected(path: impl Into<String>, expected: &'static str, found: &Value) -> Self {
        Self {
            path: path.into(),
            kind: SchemaErrorKind::Expected {
                expected,
                found: type_name(found).to_string(),
            },
        }
    }

    /// Missing-field error. The reported path already includes the field.
    pub fn missing(parent: &str, field: &'static str) -> Self {
        Self {
            path: child(parent, field),
            kind: SchemaErrorKind::MissingField { field },
        }
    }

    /// Wrong-literal error at `path`.
    pub fn invalid_literal(path: impl Into<String>, expected: &'static str, found: &str) -> Self {
        Self {
            path: path.into(),
            kind: SchemaErrorKind::InvalidLiteral {
                expected,
                found: format!("`{found}`"),
            },
        }
    }

    /// Union failure at `path` carrying every candidate's error.
    pub fn no_variant(path: impl Into<String>, candidates: Vec<SchemaError>) -> Self {
        Self {
            path: path.into(),
            kind: SchemaErrorKind::NoVariant { candidates },
        }
    }

    /// Free-form error at `path` from a delegated sub-validator.
    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: SchemaErrorKind::Invalid {
                message: message.into(),
            },
        }
    }

    /// Renders this error as a one-line JSON hint, the format used by the
    /// `config error hint:` log lines and by `migrate-config` stderr output.
    pub fn to_hint(&self) -> String {
        serde_json::json!({
            "path": self.path,
            "message": self.kind.to_string(),
        })
        .to_string()
    }
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.path, self.kind)
        }
    }
}

/// A non-empty collection of validation errors for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaErrors(pub Vec<SchemaError>);

impl SchemaErrors {
    /// Flattens the error tree depth-first into its leaves. Union errors
    /// contribute each candidate's leaves rather than themselves.
    pub fn leaves(&self) -> Vec<&SchemaError> {
        fn collect<'a>(err: &'a SchemaError, out: &mut Vec<&'a SchemaError>) {
            match &err.kind {
                SchemaErrorKind::NoVariant { candidates } if !candidates.is_empty() => {
                    for candidate in candidates {
                        collect(candidate, out);
                    }
                }
                _ => out.push(err),
            }
        }
        let mut out = Vec::new();
        for err in &self.0 {
            collect(err, &mut out);
        }
        out
    }
}

impl From<SchemaError> for SchemaErrors {
    fn from(err: SchemaError) -> Self {
        Self(vec![err])
    }
}

impl std::fmt::Display for SchemaErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self.leaves().iter().map(ToString::to_string).collect();
        write!(f, "{}", rendered.join("; "))
    }
}

impl std::error::Error for SchemaErrors {}

// ==== Value helpers ====

/// Human-readable type name of a YAML value, used in error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "array",
        Value::Mapping(_) => "object",
        Value::Tagged(_) => "tagged value",
    }
}

/// Builds the path of a named field under `parent`.
pub fn child(parent: &str, field: &str) -> String {
    if parent.is_empty() {
        field.to_string()
    } else {
        format!("{parent}.{field}")
    }
}

/// Builds the path of a sequence element under `parent`.
pub fn element(parent: &str, index: usize) -> String {
    format!("{parent}[{index}]")
}

/// The value must be a string.
pub fn as_str<'v>(value: &'v Value, path: &str) -> Result<&'v str, SchemaError> {
    value
        .as_str()
        .ok_or_else(|| SchemaError::expected(path, "string", value))
}

/// The value must be a boolean.
pub fn as_bool(value: &Value, path: &str) -> Result<bool, SchemaError> {
    value
        .as_bool()
        .ok_or_else(|| SchemaError::expected(path, "boolean", value))
}

/// The value must be a sequence.
pub fn as_sequence<'v>(value: &'v Value, path: &str) -> Result<&'v [Value], SchemaError> {
    value
        .as_sequence()
        .map(Vec::as_slice)
        .ok_or_else(|| SchemaError::expected(path, "array", value))
}

/// The value must be a mapping.
pub fn as_mapping<'v>(value: &'v Value, path: &str) -> Result<&'v serde_yaml::Mapping, SchemaError> {
    value
        .as_mapping()
        .ok_or_else(|| SchemaError::expected(path, "object", value))
}

/// Looks a field up in a mapping value. `None` when the key is absent;
/// an explicitly-null value is returned and fails the field's own check.
pub fn get<'v>(value: &'v Value, field: &str) -> Option<&'v Value> {
    value.as_mapping().and_then(|m| m.get(field))
}

/// The field must be present under `parent_path`.
pub fn require<'v>(
    value: &'v Value,
    field: &'static str,
    parent_path: &str,
) -> Result<&'v Value, SchemaError> {
    get(value, field).ok_or_else(|| SchemaError::missing(parent_path, field))
}

/// The field must be present under `parent_path` and hold a string.
pub fn require_str<'v>(
    value: &'v Value,
    field: &'static str,
    parent_path: &str,
) -> Result<&'v str, SchemaError> {
    let field_value = require(value, field, parent_path)?;
    as_str(field_value, &child(parent_path, field))
}

/// The value must be exactly the given string literal.
pub fn expect_literal(value: &Value, literal: &'static str, path: &str) -> Result<(), SchemaError> {
    let found = as_str(value, path)?;
    if found == literal {
        Ok(())
    } else {
        Err(SchemaError::invalid_literal(path, literal, found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    // ==== type names ====

    #[test]
    fn type_names_cover_yaml_shapes() {
        assert_eq!(type_name(&yaml("null")), "null");
        assert_eq!(type_name(&yaml("true")), "boolean");
        assert_eq!(type_name(&yaml("3")), "number");
        assert_eq!(type_name(&yaml("hi")), "string");
        assert_eq!(type_name(&yaml("[1]")), "array");
        assert_eq!(type_name(&yaml("a: 1")), "object");
    }

    // ==== path building ====

    #[test]
    fn paths_compose_from_root() {
        assert_eq!(child("", "version"), "version");
        assert_eq!(child("openid_connect", "session"), "openid_connect.session");
        assert_eq!(element("allow_paths", 2), "allow_paths[2]");
    }

    // ==== accessors ====

    #[test]
    fn accessors_report_found_type() {
        // GIVEN a number where a string is required
        let err = as_str(&yaml("5"), "rejection").unwrap_err();

        // THEN the error names both sides
        assert_eq!(err.path, "rejection");
        assert_eq!(
            err.kind,
            SchemaErrorKind::Expected {
                expected: "string",
                found: "number".to_string()
            }
        );
    }

    #[test]
    fn require_reports_field_path() {
        let doc = yaml("version: '1'");
        let err = require(&doc, "config_for", "").unwrap_err();
        assert_eq!(err.path, "config_for");
    }

    #[test]
    fn literal_mismatch_quotes_found_value() {
        let doc = yaml("config_for: other_server");
        let err =
            expect_literal(doc.get("config_for").unwrap(), "rich_piping_server", "config_for")
                .unwrap_err();
        assert!(err.to_string().contains("`other_server`"));
    }

    // ==== leaf flattening ====

    #[test]
    fn leaves_flatten_nested_unions() {
        // GIVEN a union error holding a plain error and a nested union
        let inner = SchemaError::no_variant(
            "allow_paths[0]",
            vec![
                SchemaError::expected("allow_paths[0]", "string", &yaml("3")),
                SchemaError::missing("allow_paths[0]", "value"),
            ],
        );
        let errs = SchemaErrors(vec![
            SchemaError::missing("", "rejection"),
            inner,
        ]);

        // WHEN flattening
        let leaves = errs.leaves();

        // THEN only leaf errors remain, in document order
        assert_eq!(leaves.len(), 3);
        assert_eq!(leaves[0].path, "rejection");
        assert_eq!(leaves[1].path, "allow_paths[0]");
        assert_eq!(leaves[2].path, "allow_paths[0].value");
    }

    #[test]
    fn hint_is_one_json_object() {
        let err = SchemaError::missing("", "allow_paths");
        let hint = err.to_hint();
        let parsed: serde_json::Value = serde_json::from_str(&hint).unwrap();
        assert_eq!(parsed["path"], "allow_paths");
        assert!(parsed["message"].as_str().unwrap().contains("missing"));
    }
}
