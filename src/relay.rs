//! Upstream relay.
//!
//! Requests that clear every gate are handed to a [`RelayHandler`]. The
//! production implementation forwards to a configured upstream over HTTP/1.1
//! with bodies streamed in both directions, which is what lets long-lived
//! sender/receiver pipes flow through the gateway untouched.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{HeaderMap, Uri, header};
use axum::response::Response;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::{Error, Result};

/// Forwards an admitted request to the backing relay.
#[async_trait]
pub trait RelayHandler: Send + Sync {
    /// Forward the request and return the upstream response.
    ///
    /// Both bodies stream; neither side is buffered. Transfers have no
    /// deadline since a pipe legitimately stays open until its peer shows
    /// up.
    async fn handle(&self, req: Request) -> Result<Response>;
}

/// Connection-scoped headers that must not cross the proxy hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Relay that proxies to a fixed upstream origin.
#[derive(Debug)]
pub struct ProxyRelay {
    /// Pooled HTTP/1.1 client
    client: Client<HttpConnector, Body>,
    /// Scheme of the upstream origin
    scheme: Scheme,
    /// Host and port of the upstream origin
    authority: Authority,
}

impl ProxyRelay {
    /// Create a relay targeting the given upstream URL. The URL's path is
    /// ignored; the request's own (possibly rewritten) target is used.
    pub fn new(upstream: &Uri) -> Result<Self> {
        let scheme = upstream.scheme().cloned().unwrap_or(Scheme::HTTP);
        let authority = upstream
            .authority()
            .cloned()
            .ok_or_else(|| Error::upstream(format!("upstream URL has no authority: {upstream}")))?;

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            client,
            scheme,
            authority,
        })
    }

    /// Graft the upstream origin onto a request target.
    fn target_uri(&self, uri: Uri) -> Result<Uri> {
        let mut parts = uri.into_parts();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(self.authority.clone());
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        Uri::from_parts(parts).map_err(|e| Error::upstream(format!("invalid upstream target: {e}")))
    }
}

#[async_trait]
impl RelayHandler for ProxyRelay {
    async fn handle(&self, req: Request) -> Result<Response> {
        let (mut parts, body) = req.into_parts();

        parts.uri = self.target_uri(parts.uri)?;
        strip_connection_headers(&mut parts.headers);
        // The client derives Host from the upstream authority.
        parts.headers.remove(header::HOST);

        debug!(target = %parts.uri, "Relaying upstream");

        let response = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

fn strip_connection_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
