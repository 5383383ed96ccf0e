//! Shared fixtures for the integration tests: a minimal in-process pipe
//! upstream, a fake OIDC provider, and a gateway spawner.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::body::{Bytes, to_bytes};
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sha2::{Digest as _, Sha256};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use piping_gateway::config::NormalizedConfig;
use piping_gateway::config_ref::ConfigRef;
use piping_gateway::gateway::{AppState, ClientConn, GatewayListener, build_router};
use piping_gateway::oidc::{PendingAuthStore, SessionStore};
use piping_gateway::relay::ProxyRelay;

// ============================================================================
// Fake pipe upstream
// ============================================================================

enum PipeEntry {
    /// A sender arrived first; its body waits for the receiver.
    Stored(Bytes),
    /// A receiver arrived first and is parked on this channel.
    Waiting(oneshot::Sender<Bytes>),
}

struct PipeState {
    entries: Mutex<HashMap<String, PipeEntry>>,
    seen_targets: Mutex<Vec<String>>,
}

/// In-process stand-in for a Piping Server: a POST body crosses over to a
/// concurrent GET on the same target, in either arrival order. Records every
/// request target so tests can assert on rewrites.
pub struct FakePipe {
    pub addr: SocketAddr,
    state: Arc<PipeState>,
}

impl FakePipe {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(PipeState {
            entries: Mutex::new(HashMap::new()),
            seen_targets: Mutex::new(Vec::new()),
        });

        let app = axum::Router::new()
            .fallback(pipe_handler)
            .with_state(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn upstream_uri(&self) -> axum::http::Uri {
        format!("http://{}", self.addr).parse().unwrap()
    }

    /// Raw request targets the upstream observed, in arrival order.
    pub fn seen_targets(&self) -> Vec<String> {
        self.state.seen_targets.lock().clone()
    }
}

async fn pipe_handler(State(state): State<Arc<PipeState>>, req: Request) -> Response {
    let target = req
        .uri()
        .path_and_query()
        .map_or_else(String::new, |pq| pq.as_str().to_string());
    state.seen_targets.lock().push(target.clone());

    match *req.method() {
        Method::GET => {
            let rx = {
                let mut entries = state.entries.lock();
                match entries.remove(&target) {
                    Some(PipeEntry::Stored(bytes)) => {
                        return (StatusCode::OK, bytes).into_response();
                    }
                    Some(PipeEntry::Waiting(_)) | None => {
                        let (tx, rx) = oneshot::channel();
                        entries.insert(target, PipeEntry::Waiting(tx));
                        rx
                    }
                }
            };
            match rx.await {
                Ok(bytes) => (StatusCode::OK, bytes).into_response(),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }
        Method::POST | Method::PUT => {
            let body = to_bytes(req.into_body(), 1024 * 1024)
                .await
                .unwrap_or_default();
            let waiting = {
                let mut entries = state.entries.lock();
                match entries.remove(&target) {
                    Some(PipeEntry::Waiting(tx)) => Some(tx),
                    Some(PipeEntry::Stored(old)) => {
                        entries.insert(target, PipeEntry::Stored(old));
                        None
                    }
                    None => {
                        entries.insert(target, PipeEntry::Stored(body.clone()));
                        None
                    }
                }
            };
            if let Some(tx) = waiting {
                let _ = tx.send(body);
            }
            (StatusCode::OK, "sent").into_response()
        }
        _ => (StatusCode::OK, format!("piped: {target}")).into_response(),
    }
}

// ============================================================================
// Fake OIDC provider
// ============================================================================

struct MintedCode {
    challenge: String,
    userinfo: Value,
}

#[derive(Default)]
struct IdpState {
    issuer: String,
    codes: Mutex<HashMap<String, MintedCode>>,
    tokens: Mutex<HashMap<String, Value>>,
    token_auth_headers: Mutex<Vec<Option<String>>>,
    next_code: Mutex<u64>,
}

/// Fake OIDC provider speaking just enough of the protocol for the gateway:
/// discovery, PKCE-checked token exchange, and userinfo.
pub struct MockIdp {
    pub addr: SocketAddr,
    state: Arc<IdpState>,
}

impl MockIdp {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(IdpState {
            issuer: format!("http://{addr}"),
            ..IdpState::default()
        });

        let app = axum::Router::new()
            .route("/.well-known/openid-configuration", get(discovery_handler))
            .route("/token", post(token_handler))
            .route("/userinfo", get(userinfo_handler))
            .with_state(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn issuer(&self) -> String {
        self.state.issuer.clone()
    }

    /// Mint an authorization code bound to a PKCE challenge, as if the user
    /// had just logged in and consented with this identity.
    pub fn mint_code(&self, code_challenge: &str, userinfo: Value) -> String {
        let mut next = self.state.next_code.lock();
        *next += 1;
        let code = format!("code-{next}");
        self.state.codes.lock().insert(
            code.clone(),
            MintedCode {
                challenge: code_challenge.to_string(),
                userinfo,
            },
        );
        code
    }

    /// Authorization headers seen by the token endpoint.
    pub fn token_auth_headers(&self) -> Vec<Option<String>> {
        self.state.token_auth_headers.lock().clone()
    }
}

async fn discovery_handler(State(state): State<Arc<IdpState>>) -> Json<Value> {
    let issuer = &state.issuer;
    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/auth"),
        "token_endpoint": format!("{issuer}/token"),
        "userinfo_endpoint": format!("{issuer}/userinfo"),
    }))
}

#[derive(serde::Deserialize)]
struct TokenForm {
    grant_type: String,
    code: String,
    code_verifier: String,
}

async fn token_handler(State(state): State<Arc<IdpState>>, req: Request) -> Response {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    state.token_auth_headers.lock().push(auth_header);

    let body = to_bytes(req.into_body(), 64 * 1024).await.unwrap_or_default();
    let Ok(form) = serde_urlencoded::from_bytes::<TokenForm>(&body) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_request"}))).into_response();
    };
    if form.grant_type != "authorization_code" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "unsupported_grant_type"})),
        )
            .into_response();
    }

    let Some(minted) = state.codes.lock().remove(&form.code) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant"}))).into_response();
    };

    // PKCE: the verifier must hash to the challenge the code was minted for.
    let hashed = URL_SAFE_NO_PAD.encode(Sha256::digest(form.code_verifier.as_bytes()));
    if hashed != minted.challenge {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant"}))).into_response();
    }

    let access_token = format!("at-{}", form.code);
    state
        .tokens
        .lock()
        .insert(access_token.clone(), minted.userinfo);
    Json(json!({"access_token": access_token, "token_type": "Bearer"})).into_response()
}

async fn userinfo_handler(State(state): State<Arc<IdpState>>, req: Request) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from);
    let userinfo = token.and_then(|t| state.tokens.lock().get(&t).cloned());
    match userinfo {
        Some(userinfo) => Json(userinfo).into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

// ============================================================================
// Gateway under test
// ============================================================================

pub struct TestGateway {
    pub addr: SocketAddr,
    /// Live handle; tests swap configs through it mid-flight.
    pub config_ref: ConfigRef,
}

impl TestGateway {
    pub fn url(&self, target: &str) -> String {
        format!("http://{}{target}", self.addr)
    }

    pub fn install(&self, config: NormalizedConfig) {
        self.config_ref.set(Some(Arc::new(config)));
    }
}

/// Spawn a gateway on an ephemeral port, relaying to `upstream`.
pub async fn spawn_gateway(
    config: Option<NormalizedConfig>,
    upstream: &axum::http::Uri,
) -> TestGateway {
    let config_ref = ConfigRef::new();
    if let Some(config) = config {
        config_ref.set(Some(Arc::new(config)));
    }
    let state = Arc::new(AppState {
        config_ref: config_ref.clone(),
        sessions: SessionStore::new(),
        pending: PendingAuthStore::new(),
        relay: Arc::new(ProxyRelay::new(upstream).unwrap()),
    });

    let listener = GatewayListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<ClientConn>(),
        )
        .await
        .unwrap();
    });

    TestGateway { addr, config_ref }
}

/// HTTP client that does not follow redirects; the tests walk them by hand.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}
