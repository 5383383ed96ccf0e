//! Request pipeline.
//!
//! Every request walks the same gauntlet: path allow-list, basic auth,
//! OIDC, index rewrite, relay. The first gate that refuses produces the
//! response; only a request that clears all of them reaches the upstream.

use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::http::header::USER_AGENT;
use axum::response::{IntoResponse, Response};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use super::authorize::{self, PathDecision};
use super::basic_auth::{self, BasicAuthDecision};
use super::reject;
use super::server::{ClientConn, close_without_response};
use crate::config::AllowPath;
use crate::config_ref::ConfigRef;
use crate::oidc::{FlowOutcome, OidcFlow, PendingAuthStore, SessionStore};
use crate::relay::RelayHandler;

/// Shared application state
pub struct AppState {
    /// Live config snapshot handle
    pub config_ref: ConfigRef,
    /// Authenticated OIDC sessions
    pub sessions: SessionStore,
    /// In-flight OIDC authorization attempts
    pub pending: PendingAuthStore,
    /// Upstream relay
    pub relay: Arc<dyn RelayHandler>,
}

/// Create the router.
///
/// The gateway fronts an opaque relay whose path space is unbounded, so
/// there is no route table; a single fallback handler runs the pipeline
/// for every method and path.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_request(
    State(state): State<Arc<AppState>>,
    ConnectInfo(conn): ConnectInfo<ClientConn>,
    mut req: Request,
) -> Response {
    // Nothing loaded yet (or every load so far failed). Reveal nothing
    // about the gateway, not even an HTTP error.
    let Some(config) = state.config_ref.get() else {
        debug!("No valid config loaded, closing connection");
        return close_without_response(&conn.close_switch);
    };

    // Gate 1: the path allow-list, on the raw request target.
    let decision = authorize::resolve(
        config.allow_paths.as_deref(),
        req.uri().path_and_query().map(|pq| pq.as_str()),
    );
    if decision == PathDecision::Rejected {
        debug!(target = %req.uri(), "Request target not allowed");
        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        return reject::apply(&config.rejection, &conn.close_switch, user_agent);
    }

    // Gate 2: basic auth. An empty user list locks everyone out.
    if let Some(users) = &config.basic_auth_users {
        if basic_auth::check(users, req.headers()) == BasicAuthDecision::Denied {
            debug!("Basic auth denied");
            return basic_auth::challenge_response();
        }
    }

    // Gate 3: OIDC.
    if let Some(oidc_config) = &config.openid_connect {
        let client = match state.config_ref.oidc_client(oidc_config).await {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "OIDC provider discovery failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "OpenID Connect provider is not available\n",
                )
                    .into_response();
            }
        };
        let flow = OidcFlow {
            config: oidc_config,
            client: &client,
            sessions: &state.sessions,
            pending: &state.pending,
        };
        // The flow only reads the request head, and axum's body type is not
        // `Sync`, which would make this future non-`Send` while `&req` is
        // held across the flow's awaits. Detach the body for the call.
        let (parts, body) = req.into_parts();
        let head = axum::http::Request::from_parts(parts, ());
        let outcome = flow.handle(&head).await;
        let (parts, ()) = head.into_parts();
        req = Request::from_parts(parts, body);
        match outcome {
            FlowOutcome::Responded(response) => return *response,
            FlowOutcome::Authorized(_) => {}
        }
    }

    // All gates passed. Index paths relay with their prefix stripped; the
    // rewrite happens after the gates so the OIDC return target keeps the
    // path the client actually asked for.
    if let PathDecision::Allowed(AllowPath::Index(value)) = decision {
        let rewritten = authorize::rewrite_index_target(req.uri(), value);
        debug!(from = %req.uri(), to = %rewritten, "Stripped index prefix");
        *req.uri_mut() = rewritten;
    }

    match state.relay.handle(req).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Relay request failed");
            (StatusCode::BAD_GATEWAY, "Bad Gateway\n").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use crate::config::{BasicAuthUser, NormalizedConfig, Rejection};
    use crate::gateway::server::{CloseSwitch, ConnectionClosed};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::header::AUTHORIZATION;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    /// Relay stub that records the targets it was asked to forward.
    #[derive(Default)]
    struct RecordingRelay {
        targets: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RelayHandler for RecordingRelay {
        async fn handle(&self, req: Request) -> Result<Response> {
            self.targets.lock().push(req.uri().to_string());
            Ok((StatusCode::OK, "relayed").into_response())
        }
    }

    struct Harness {
        relay: Arc<RecordingRelay>,
        switch: CloseSwitch,
        app: Router,
        config_ref: ConfigRef,
    }

    fn harness(config: Option<NormalizedConfig>) -> Harness {
        let relay = Arc::new(RecordingRelay::default());
        let config_ref = ConfigRef::new();
        if let Some(config) = config {
            config_ref.set(Some(Arc::new(config)));
        }
        let state = Arc::new(AppState {
            config_ref: config_ref.clone(),
            sessions: SessionStore::new(),
            pending: PendingAuthStore::new(),
            relay: Arc::clone(&relay) as Arc<dyn RelayHandler>,
        });
        let switch = CloseSwitch::default();
        let app = build_router(state).layer(MockConnectInfo(ClientConn {
            remote_addr: "127.0.0.1:12345".parse().unwrap(),
            close_switch: switch.clone(),
        }));
        Harness {
            relay,
            switch,
            app,
            config_ref,
        }
    }

    fn open_config() -> NormalizedConfig {
        NormalizedConfig {
            basic_auth_users: None,
            allow_paths: None,
            rejection: Rejection::SocketClose,
            openid_connect: None,
        }
    }

    fn get(target: &str) -> Request {
        Request::builder()
            .uri(target)
            .body(Body::empty())
            .unwrap()
    }

    // GIVEN no loaded config THEN the connection is severed without a reply
    #[tokio::test]
    async fn missing_config_closes_the_connection() {
        let h = harness(None);
        let response = h.app.oneshot(get("/anything")).await.unwrap();

        assert!(h.switch.is_engaged());
        assert!(response.extensions().get::<ConnectionClosed>().is_some());
        assert!(h.relay.targets.lock().is_empty());
    }

    // GIVEN an absent allow list THEN every target relays
    #[tokio::test]
    async fn absent_allow_list_relays_everything() {
        let h = harness(Some(open_config()));
        let response = h.app.oneshot(get("/any/path?x=1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.relay.targets.lock().as_slice(), ["/any/path?x=1"]);
        assert!(!h.switch.is_engaged());
    }

    #[tokio::test]
    async fn rejected_target_with_socket_close_severs_connection() {
        let mut config = open_config();
        config.allow_paths = Some(vec![AllowPath::Path("/ok".into())]);
        let h = harness(Some(config));

        let response = h.app.oneshot(get("/not-ok")).await.unwrap();

        assert!(h.switch.is_engaged());
        assert!(response.extensions().get::<ConnectionClosed>().is_some());
        assert!(h.relay.targets.lock().is_empty());
    }

    #[tokio::test]
    async fn rejected_target_with_fake_nginx_answers_500() {
        let mut config = open_config();
        config.allow_paths = Some(vec![AllowPath::Path("/ok".into())]);
        config.rejection = Rejection::FakeNginxDown {
            nginx_version: "1.17.8".into(),
        };
        let h = harness(Some(config));

        let response = h.app.oneshot(get("/not-ok")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("server").unwrap(),
            "nginx/1.17.8"
        );
        assert!(!h.switch.is_engaged());
    }

    // Path gate runs before basic auth: a rejected target never sees a 401.
    #[tokio::test]
    async fn path_gate_outranks_basic_auth() {
        let mut config = open_config();
        config.basic_auth_users = Some(vec![BasicAuthUser {
            username: "aladdin".into(),
            password: "opensesame".into(),
        }]);
        config.allow_paths = Some(vec![AllowPath::Path("/ok".into())]);
        let h = harness(Some(config));

        let response = h.app.oneshot(get("/not-ok")).await.unwrap();
        assert!(response.extensions().get::<ConnectionClosed>().is_some());
    }

    #[tokio::test]
    async fn basic_auth_challenges_and_admits() {
        let mut config = open_config();
        config.basic_auth_users = Some(vec![BasicAuthUser {
            username: "aladdin".into(),
            password: "opensesame".into(),
        }]);
        let h = harness(Some(config));

        let denied = h
            .app
            .clone()
            .oneshot(get("/secret"))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut authed = get("/secret");
        authed.headers_mut().insert(
            AUTHORIZATION,
            // aladdin:opensesame
            "Basic YWxhZGRpbjpvcGVuc2VzYW1l".parse().unwrap(),
        );
        let admitted = h.app.oneshot(authed).await.unwrap();
        assert_eq!(admitted.status(), StatusCode::OK);
        assert_eq!(h.relay.targets.lock().as_slice(), ["/secret"]);
    }

    // Index paths are relayed with the prefix stripped, query intact.
    #[tokio::test]
    async fn index_prefix_is_stripped_before_relaying() {
        let mut config = open_config();
        config.allow_paths = Some(vec![AllowPath::Index("/team-a/".into())]);
        let h = harness(Some(config));

        let response = h.app.oneshot(get("/team-a/file?n=2")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.relay.targets.lock().as_slice(), ["/file?n=2"]);
    }

    // A reload that swaps the config changes behavior without a restart.
    #[tokio::test]
    async fn config_swap_applies_to_the_next_request() {
        let mut config = open_config();
        config.allow_paths = Some(vec![AllowPath::Path("/old".into())]);
        let h = harness(Some(config));

        let before = h.app.clone().oneshot(get("/new")).await.unwrap();
        assert_eq!(before.status().as_u16(), 444);

        let mut swapped = open_config();
        swapped.allow_paths = Some(vec![AllowPath::Path("/new".into())]);
        h.config_ref.set(Some(Arc::new(swapped)));

        let after = h.app.oneshot(get("/new")).await.unwrap();
        assert_eq!(after.status(), StatusCode::OK);
        assert_eq!(h.relay.targets.lock().as_slice(), ["/new"]);
    }
}
