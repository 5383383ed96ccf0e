//! Rejection policies for disallowed requests.
//!
//! `socket_close` ends the connection without a single HTTP byte (see the
//! server's close switch). `fake_nginx_down` answers with a byte-for-byte
//! plausible nginx 500 page so the gateway is indistinguishable from an
//! ordinary broken deployment.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use crate::config::Rejection;
use crate::gateway::server::{CloseSwitch, close_without_response};

const PADDING_LINE: &str = "<!-- a padding to disable MSIE and Chrome friendly error page -->\r\n";

/// Applies the configured rejection policy.
pub fn apply(rejection: &Rejection, close_switch: &CloseSwitch, user_agent: &str) -> Response {
    match rejection {
        Rejection::SocketClose => close_without_response(close_switch),
        Rejection::FakeNginxDown { nginx_version } => {
            fake_nginx_response(nginx_version, user_agent)
        }
    }
}

/// Builds the synthetic nginx error page.
pub fn fake_nginx_response(nginx_version: &str, user_agent: &str) -> Response {
    let body = fake_nginx_body(nginx_version, user_agent);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [
            (header::SERVER, format!("nginx/{nginx_version}")),
            (header::DATE, http_date_now()),
            (header::CONTENT_TYPE, "text/html".to_string()),
            (header::CONTENT_LENGTH, body.len().to_string()),
            (header::CONNECTION, "close".to_string()),
        ],
        body,
    )
        .into_response()
}

fn fake_nginx_body(nginx_version: &str, user_agent: &str) -> String {
    let mut body = format!(
        "<html>\r\n\
         <head><title>500 Internal Server Error</title></head>\r\n\
         <body bgcolor=\"white\">\r\n\
         <center><h1>500 Internal Server Error</h1></center>\r\n\
         <hr><center>nginx/{nginx_version}</center>\r\n\
         </body>\r\n\
         </html>\r\n"
    );
    // IE and Chrome replace short error bodies with their own page; the
    // padding pushes the body over that threshold.
    if is_msie_or_chrome(user_agent) {
        for _ in 0..6 {
            body.push_str(PADDING_LINE);
        }
    }
    body
}

fn is_msie_or_chrome(user_agent: &str) -> bool {
    ["MSIE", "Trident", "Chrome", "CriOS"]
        .iter()
        .any(|marker| user_agent.contains(marker))
}

fn http_date_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
