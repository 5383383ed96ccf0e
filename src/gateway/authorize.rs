//! Path authorization and the index rewrite.
//!
//! Rules are evaluated in declaration order against the raw request target
//! (path plus query, byte for byte, no normalization). First match wins.

use axum::http::Uri;
use axum::http::uri::PathAndQuery;
use regex::Regex;
use tracing::warn;

use crate::config::AllowPath;

/// Verdict of the path gate for one request.
#[derive(Debug, PartialEq, Eq)]
pub enum PathDecision<'a> {
    /// No allow-list is configured; everything passes.
    AlwaysAllowed,
    /// The request matched this rule. Index rules trigger a rewrite later.
    Allowed(&'a AllowPath),
    /// Nothing matched; the rejection policy decides what happens.
    Rejected,
}

/// Resolves the verdict for a request target.
pub fn resolve<'a>(
    allow_paths: Option<&'a [AllowPath]>,
    target: Option<&str>,
) -> PathDecision<'a> {
    let Some(allow_paths) = allow_paths else {
        return PathDecision::AlwaysAllowed;
    };
    let Some(target) = target else {
        return PathDecision::Rejected;
    };
    allow_paths
        .iter()
        .find(|path| matches(path, target))
        .map_or(PathDecision::Rejected, PathDecision::Allowed)
}

fn matches(path: &AllowPath, target: &str) -> bool {
    match path {
        AllowPath::Path(value) => target == value,
        // Compiled per request: cheap at this rate and never stale across
        // hot reloads.
        AllowPath::Regexp(pattern) => match Regex::new(pattern) {
            Ok(regex) => regex.is_match(target),
            Err(err) => {
                warn!(pattern, error = %err, "allow path regexp does not compile");
                false
            }
        },
        AllowPath::Index(prefix) => {
            with_trailing_slash(target).starts_with(&with_trailing_slash(prefix))
        }
    }
}

fn with_trailing_slash(s: &str) -> String {
    format!("{}/", s.trim_end_matches('/'))
}

/// Rewrites a request target after an index match: the prefix is stripped;
/// a target equal to the index value becomes `/`. The remainder always gets
/// a leading slash because an HTTP request target cannot be empty or
/// relative.
pub fn rewrite_index_target(uri: &Uri, index_value: &str) -> Uri {
    let target = uri.path_and_query().map_or("/", PathAndQuery::as_str);
    let remainder = if target == index_value {
        "/".to_string()
    } else {
        let stripped = target.get(index_value.len()..).unwrap_or("");
        if stripped.is_empty() {
            "/".to_string()
        } else if stripped.starts_with('/') {
            stripped.to_string()
        } else {
            format!("/{stripped}")
        }
    };
    let path_and_query = PathAndQuery::try_from(remainder.as_str())
        .unwrap_or_else(|_| PathAndQuery::from_static("/"));
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts).unwrap_or_else(|_| Uri::from_static("/"))
}
