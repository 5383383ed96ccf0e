//! HTTP Basic authentication gate.
//!
//! Runs only when users are configured. Credential comparison is constant
//! time so the gate does not leak which usernames exist.

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use subtle::ConstantTimeEq as _;

use crate::config::BasicAuthUser;

/// Verdict of the basic-auth gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicAuthDecision {
    /// A configured credential pair matched.
    Allowed,
    /// Missing, malformed, or mismatched credentials.
    Denied,
}

/// Checks the request's Basic credential against the configured users.
pub fn check(users: &[BasicAuthUser], headers: &HeaderMap) -> BasicAuthDecision {
    let Some((username, password)) = parse_credentials(headers) else {
        return BasicAuthDecision::Denied;
    };
    for user in users {
        let username_matches = user.username.as_bytes().ct_eq(username.as_bytes());
        let password_matches = user.password.as_bytes().ct_eq(password.as_bytes());
        if bool::from(username_matches & password_matches) {
            return BasicAuthDecision::Allowed;
        }
    }
    BasicAuthDecision::Denied
}

fn parse_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, payload) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(payload.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// The 401 challenge. Does not close the connection; the client may retry
/// with credentials on the same socket.
pub fn challenge_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, r#"Basic realm="example""#)],
        "Access denied\n",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    fn users() -> Vec<BasicAuthUser> {
        vec![
            BasicAuthUser {
                username: "user1".to_string(),
                password: "pass1234".to_string(),
            },
            BasicAuthUser {
                username: "user2".to_string(),
                password: "secret".to_string(),
            },
        ]
    }

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    fn basic(username: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
    }

    // ==== decisions ====

    #[test]
    fn correct_credentials_are_allowed() {
        let headers = headers_with_auth(&basic("user1", "pass1234"));
        assert_eq!(check(&users(), &headers), BasicAuthDecision::Allowed);

        // any configured pair works
        let headers = headers_with_auth(&basic("user2", "secret"));
        assert_eq!(check(&users(), &headers), BasicAuthDecision::Allowed);
    }

    #[test]
    fn missing_header_is_denied() {
        assert_eq!(check(&users(), &HeaderMap::new()), BasicAuthDecision::Denied);
    }

    #[test]
    fn wrong_password_is_denied() {
        let headers = headers_with_auth(&basic("user1", "wrong"));
        assert_eq!(check(&users(), &headers), BasicAuthDecision::Denied);
    }

    #[test]
    fn crossed_pairs_are_denied() {
        // username of one user with the password of another
        let headers = headers_with_auth(&basic("user1", "secret"));
        assert_eq!(check(&users(), &headers), BasicAuthDecision::Denied);
    }

    #[test]
    fn malformed_payloads_are_denied() {
        for value in ["Basic", "Basic !!!not-base64!!!", "Bearer abc"] {
            let headers = headers_with_auth(value);
            assert_eq!(check(&users(), &headers), BasicAuthDecision::Denied, "{value}");
        }
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let encoded = STANDARD.encode("user1:pass1234");
        let headers = headers_with_auth(&format!("basic {encoded}"));
        assert_eq!(check(&users(), &headers), BasicAuthDecision::Allowed);
    }

    #[test]
    fn password_may_contain_colons() {
        let configured = vec![BasicAuthUser {
            username: "u".to_string(),
            password: "a:b:c".to_string(),
        }];
        let headers = headers_with_auth(&basic("u", "a:b:c"));
        assert_eq!(check(&configured, &headers), BasicAuthDecision::Allowed);
    }

    // ==== challenge ====

    #[test]
    fn challenge_carries_the_www_authenticate_header() {
        let response = challenge_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok()),
            Some(r#"Basic realm="example""#)
        );
    }
}
