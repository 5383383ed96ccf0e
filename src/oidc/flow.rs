//! The per-request OpenID Connect flow.
//!
//! Runs in front of the relay for every request when OIDC is configured.
//! Outcomes: answer a CORS preflight, serve the provider callback, start an
//! authorization round trip, hand a session id to a waiting forward target,
//! deny a disallowed identity, or let the request through to the relay.

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use regex::Regex;
use tracing::{info, warn};

use crate::config::{AllowUserinfo, OidcConfig, OidcCookie, OidcSessionForward};
use crate::oidc::client::{CallbackParams, OidcClient, Userinfo, generate_pkce};
use crate::oidc::session::{PendingAuthStore, SessionStore};

/// Browser-side retry budget of the session-forward page.
const FORWARD_MAX_ATTEMPTS: u32 = 5;
/// Delay between session-forward retries, in milliseconds.
const FORWARD_RETRY_DELAY_MS: u64 = 1000;

/// What the flow decided for one request.
pub enum FlowOutcome {
    /// The request is authenticated and allowed; proceed to the relay.
    Authorized(Box<Userinfo>),
    /// The flow produced the response itself.
    Responded(Box<Response>),
}

impl FlowOutcome {
    fn responded(response: Response) -> Self {
        Self::Responded(Box::new(response))
    }
}

/// One request's view of the OIDC machinery.
pub struct OidcFlow<'a> {
    /// The active OIDC config snapshot.
    pub config: &'a OidcConfig,
    /// The discovered provider client.
    pub client: &'a OidcClient,
    /// Shared session store.
    pub sessions: &'a SessionStore,
    /// Shared in-flight-authorization store.
    pub pending: &'a PendingAuthStore,
}

impl OidcFlow<'_> {
    /// Runs the flow for a request.
    ///
    /// Generic over the body type because the flow only reads the request
    /// head; callers inside a `Send` future must pass a head with a `Sync`
    /// body (axum's default body is not).
    pub async fn handle<B>(&self, req: &Request<B>) -> FlowOutcome {
        // The TTL follows the live config, so refresh it on every request.
        self.sessions
            .set_age_seconds(self.config.session.age_seconds);

        if req.method() == Method::OPTIONS {
            if let Some(custom_header) = &self.config.session.custom_http_header {
                return FlowOutcome::responded(preflight_response(custom_header, req.headers()));
            }
        }

        if req.uri().path() == self.config.redirect.path {
            return FlowOutcome::responded(self.handle_callback(req).await);
        }

        let session_id = self.session_id_from(req.headers());
        let Some(session_id) = session_id else {
            return FlowOutcome::responded(self.start_authorization(req));
        };
        let Some(userinfo) = self.sessions.find_valid_userinfo(&session_id) else {
            // Unknown or expired ids restart the flow like a missing one.
            return FlowOutcome::responded(self.start_authorization(req));
        };
        if !userinfo_is_allowed(&self.config.allow_userinfos, &userinfo) {
            let body = format!("NOT allowed user: {}\n", userinfo.to_json());
            return FlowOutcome::responded((StatusCode::BAD_REQUEST, body).into_response());
        }

        if let Some(forward) = &self.config.session.forward {
            let forward_url = req
                .uri()
                .query()
                .and_then(|query| query_param(query, &forward.query_param_name));
            if let Some(forward_url) = forward_url {
                return FlowOutcome::responded(session_forward_response(
                    forward,
                    &forward_url,
                    &session_id,
                    None,
                ));
            }
        }

        FlowOutcome::Authorized(Box::new(userinfo))
    }

    /// Finds a session id in the configured cookie, falling back to the
    /// configured custom header.
    fn session_id_from(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(from_cookie) = cookie_value(headers, &self.config.session.cookie.name) {
            return Some(from_cookie);
        }
        let custom_header = self.config.session.custom_http_header.as_deref()?;
        let name = HeaderName::from_bytes(custom_header.as_bytes()).ok()?;
        headers
            .get(&name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    /// Redirects the browser to the provider, remembering this attempt
    /// server-side under a fresh `state` token.
    fn start_authorization<B>(&self, req: &Request<B>) -> Response {
        let pkce = generate_pkce();
        let return_to = req
            .uri()
            .path_and_query()
            .map(|target| target.as_str().to_string());
        let session_forward_url = self.config.session.forward.as_ref().and_then(|forward| {
            req.uri()
                .query()
                .and_then(|query| query_param(query, &forward.query_param_name))
        });
        let state = self
            .pending
            .insert(pkce.verifier, return_to, session_forward_url);
        match self.client.authorization_url(&pkce.challenge, &state) {
            Ok(location) => {
                (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
            }
            Err(err) => {
                warn!(error = %err, "could not build the authorization URL");
                StatusCode::BAD_REQUEST.into_response()
            }
        }
    }

    /// Serves the provider callback: code exchange, userinfo fetch,
    /// allow-list check, session creation, and the response that carries
    /// the browser onward.
    async fn handle_callback<B>(&self, req: &Request<B>) -> Response {
        let params = CallbackParams::from_query(req.uri().query().unwrap_or(""));

        let attempt = params.state.as_deref().and_then(|s| self.pending.take(s));
        let Some(attempt) = attempt else {
            info!("callback with unknown or expired state");
            return StatusCode::BAD_REQUEST.into_response();
        };
        if let Some(error) = &params.error {
            info!(
                error,
                detail = params.error_description.as_deref(),
                "provider denied the authorization request"
            );
            return StatusCode::BAD_REQUEST.into_response();
        }
        let Some(code) = &params.code else {
            info!("callback without an authorization code");
            return StatusCode::BAD_REQUEST.into_response();
        };

        let token_set = match self.client.exchange_code(code, &attempt.code_verifier).await {
            Ok(token_set) => token_set,
            Err(err) => {
                info!(error = %err, "token exchange failed");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        let Some(access_token) = &token_set.access_token else {
            return (StatusCode::BAD_REQUEST, "Access token not set\n").into_response();
        };
        let userinfo = match self.client.fetch_userinfo(access_token).await {
            Ok(userinfo) => userinfo,
            Err(err) => {
                info!(error = %err, "userinfo fetch failed");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        if !userinfo_is_allowed(&self.config.allow_userinfos, &userinfo) {
            return (StatusCode::BAD_REQUEST, "NOT allowed user\n").into_response();
        }

        let session_id = self.sessions.set_userinfo(userinfo.clone());
        self.log_session_created(&userinfo);
        let set_cookie = set_cookie_value(
            &self.config.session.cookie,
            &session_id,
            self.config.session.age_seconds,
        );

        if let (Some(forward), Some(forward_url)) =
            (&self.config.session.forward, &attempt.session_forward_url)
        {
            return session_forward_response(forward, forward_url, &session_id, Some(set_cookie));
        }

        match &attempt.return_to {
            None => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/html".to_string()),
                    (header::SET_COOKIE, set_cookie),
                ],
                format!("allowed: {}\n", userinfo.to_json()),
            )
                .into_response(),
            Some(return_to) => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/html".to_string()),
                    (header::SET_COOKIE, set_cookie),
                ],
                meta_refresh_page(return_to),
            )
                .into_response(),
        }
    }

    fn log_session_created(&self, userinfo: &Userinfo) {
        let claims = self
            .config
            .log
            .as_ref()
            .and_then(|log| log.userinfo.as_ref());
        match claims {
            Some(claims) => {
                let sub = claims.sub.then(|| userinfo.sub.clone()).flatten();
                let email = claims.email.then(|| userinfo.email.clone()).flatten();
                info!(
                    sub = sub.as_deref(),
                    email = email.as_deref(),
                    "session created"
                );
            }
            None => info!("session created"),
        }
    }
}

/// First-match evaluation of the allow-list. An empty list denies everyone.
pub fn userinfo_is_allowed(allow_userinfos: &[AllowUserinfo], userinfo: &Userinfo) -> bool {
    allow_userinfos.iter().any(|entry| match entry {
        AllowUserinfo::Sub { sub } => userinfo.sub.as_deref() == Some(sub.as_str()),
        AllowUserinfo::Email {
            email,
            require_verification,
        } => {
            if userinfo.email.as_deref() != Some(email.as_str()) {
                return false;
            }
            // Verification is required unless explicitly waived.
            *require_verification == Some(false) || userinfo.email_verified == Some(true)
        }
    })
}

/// Answers a CORS preflight for the custom session header transport.
pub fn preflight_response(custom_header: &str, request_headers: &HeaderMap) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, POST, PUT, OPTIONS"),
    );
    let allow_headers = format!("Content-Type, Content-Disposition, X-Piping, {custom_header}");
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::try_from(allow_headers).unwrap_or_else(|_| {
            HeaderValue::from_static("Content-Type, Content-Disposition, X-Piping")
        }),
    );
    let private_network = request_headers
        .get(HeaderName::from_static("access-control-request-private-network"))
        .and_then(|value| value.to_str().ok())
        == Some("true");
    if private_network {
        headers.insert(
            HeaderName::from_static("access-control-allow-private-network"),
            HeaderValue::from_static("true"),
        );
    }
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Access-Control-Allow-Headers"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    (StatusCode::OK, headers).into_response()
}

/// Validates the forward target and renders the page that hands the session
/// id over. A pending `Set-Cookie` is attached either way so a denied
/// target does not cost the fresh session.
fn session_forward_response(
    forward: &OidcSessionForward,
    forward_url: &str,
    session_id: &str,
    set_cookie: Option<String>,
) -> Response {
    let allowed = match Regex::new(&forward.allow_url_regexp) {
        Ok(pattern) => pattern.is_match(forward_url),
        Err(err) => {
            warn!(error = %err, "session forward allow_url_regexp does not compile");
            false
        }
    };
    let mut response = if allowed {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html")],
            session_forward_page(forward_url, session_id),
        )
            .into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "text/html")],
            "session forward URL is not allowed\n",
        )
            .into_response()
    };
    if let Some(cookie) = set_cookie {
        match HeaderValue::try_from(cookie) {
            Ok(value) => {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
            Err(_) => warn!("session cookie value is not a valid header value"),
        }
    }
    response
}

/// Serializes the session cookie.
fn set_cookie_value(cookie: &OidcCookie, session_id: &str, max_age_seconds: u64) -> String {
    let mut value = format!("{}={session_id}; Max-Age={max_age_seconds}", cookie.name);
    if cookie.http_only {
        value.push_str("; HttpOnly");
    }
    value
}

/// Reads a cookie by name from the request headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header_value in headers.get_all(header::COOKIE) {
        let Ok(cookies) = header_value.to_str() else {
            continue;
        };
        for pair in cookies.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key.as_ref() == name)
        .map(|(_, value)| value.into_owned())
}

/// A zero-delay meta refresh back to the path the user originally asked
/// for. A meta refresh rather than a 30x so the session cookie reliably
/// sticks before the next navigation.
fn meta_refresh_page(return_to: &str) -> String {
    let quoted = serde_json::to_string(return_to).unwrap_or_else(|_| String::from("\"/\""));
    format!(r#"<html><head><meta http-equiv="refresh" content=0;url={quoted}></head></html>"#)
}

/// The page that POSTs the session id to the forward target, retrying a
/// few times, then closes itself.
fn session_forward_page(forward_url: &str, session_id: &str) -> String {
    let url = serde_json::to_string(forward_url).unwrap_or_else(|_| String::from("\"\""));
    let id = serde_json::to_string(session_id).unwrap_or_else(|_| String::from("\"\""));
    format!(
        r#"<html>
<head>
<script>
(async () => {{
  for (let attempt = 0; attempt < {FORWARD_MAX_ATTEMPTS}; attempt++) {{
    try {{
      const res = await fetch({url}, {{
        method: "POST",
        mode: "cors",
        headers: {{ "Content-Type": "application/json" }},
        body: JSON.stringify({{ session_id: {id} }}),
      }});
      if (res.ok) {{
        window.close();
        return;
      }}
    }} catch {{
    }}
    await new Promise((resolve) => setTimeout(resolve, {FORWARD_RETRY_DELAY_MS}));
  }}
}})();
</script>
</head>
<body>Forwarding the session...</body>
</html>
"#
    )
}
