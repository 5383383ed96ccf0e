//! HTTP server and connection plumbing.
//!
//! Every accepted TCP connection is wrapped in a [`SwitchedStream`] that
//! carries a [`CloseSwitch`]. Handlers that must reject a request without
//! revealing the gateway's existence engage the switch; from that point on
//! the stream reads EOF and refuses writes, so hyper tears the connection
//! down before a single response byte reaches the wire.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::Connected;
use axum::http::StatusCode;
use axum::response::Response;
use axum::serve::{IncomingStream, Listener};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::handler::{AppState, build_router};
use crate::Result;
use crate::config_watch::ConfigWatcher;

/// Status code used internally to mark a response that never reaches the
/// wire. 444 is nginx's "close the connection" convention; by the time the
/// response propagates to the transport the stream is already dead.
const CLOSED_SENTINEL: u16 = 444;

// ============================================================================
// Close switch
// ============================================================================

/// Shared flag that severs a connection when engaged.
///
/// Cloned into the request extensions of every request on the connection, so
/// a handler deep in the pipeline can cut the socket it arrived on.
#[derive(Clone, Debug, Default)]
pub struct CloseSwitch {
    token: CancellationToken,
}

impl CloseSwitch {
    /// Mark the connection as dead. All subsequent reads on the stream
    /// return EOF and all writes fail.
    pub fn engage(&self) {
        self.token.cancel();
    }

    /// Whether the connection has been severed.
    pub fn is_engaged(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Response extension marking a connection that was closed without a reply.
/// The response itself is a placeholder and is never serialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionClosed;

/// Engage the switch and produce the placeholder response hyper will try,
/// and fail, to write.
pub fn close_without_response(switch: &CloseSwitch) -> Response {
    switch.engage();
    let mut response = Response::new(Body::empty());
    *response.status_mut() =
        StatusCode::from_u16(CLOSED_SENTINEL).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response.extensions_mut().insert(ConnectionClosed);
    response
}

// ============================================================================
// Switched stream
// ============================================================================

/// TCP stream that goes silent once its [`CloseSwitch`] is engaged.
///
/// Reads report EOF and writes report `BrokenPipe`, which makes hyper abort
/// the in-flight exchange and drop the connection with nothing written.
/// Shutdown always passes through so the FIN still goes out.
pub struct SwitchedStream {
    inner: TcpStream,
    switch: CloseSwitch,
}

impl SwitchedStream {
    fn new(inner: TcpStream) -> Self {
        Self {
            inner,
            switch: CloseSwitch::default(),
        }
    }

    /// Handle to the switch controlling this stream.
    pub fn switch(&self) -> CloseSwitch {
        self.switch.clone()
    }
}

impl AsyncRead for SwitchedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.switch.is_engaged() {
            // Empty fill = EOF as far as hyper is concerned.
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SwitchedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.switch.is_engaged() {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.switch.is_engaged() {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.switch.is_engaged() {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        Pin::new(&mut this.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

// ============================================================================
// Listener
// ============================================================================

/// TCP listener that hands out [`SwitchedStream`]s.
pub struct GatewayListener {
    inner: TcpListener,
}

impl GatewayListener {
    /// Bind to the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl Listener for GatewayListener {
    type Io = SwitchedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, remote_addr)) => {
                    let _ = stream.set_nodelay(true);
                    return (SwitchedStream::new(stream), remote_addr);
                }
                Err(e) => {
                    if is_connection_error(&e) {
                        continue;
                    }
                    // Out of fds or similar; back off instead of spinning.
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Per-connection info exposed to handlers.
#[derive(Clone, Debug)]
pub struct ClientConn {
    /// Peer address of the accepted socket.
    pub remote_addr: SocketAddr,
    /// Switch that severs this connection when engaged.
    pub close_switch: CloseSwitch,
}

impl Connected<IncomingStream<'_, GatewayListener>> for ClientConn {
    fn connect_info(stream: IncomingStream<'_, GatewayListener>) -> Self {
        Self {
            remote_addr: *stream.remote_addr(),
            close_switch: stream.io().switch(),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Gateway HTTP server.
pub struct GatewayServer {
    /// Host address to bind
    host: String,
    /// Port to bind
    port: u16,
    /// Config file to watch for live reload, if any
    config_path: Option<PathBuf>,
    /// Shared handler state
    state: Arc<AppState>,
    /// Shutdown flag
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl GatewayServer {
    /// Create a new server.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        config_path: Option<PathBuf>,
        state: Arc<AppState>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            config_path,
            state,
            shutdown_tx: None,
        }
    }

    /// Run the server until a shutdown signal arrives.
    pub async fn run(mut self) -> Result<()> {
        let addr = SocketAddr::new(
            self.host
                .parse()
                .map_err(|e| crate::Error::internal(format!("invalid host: {e}")))?,
            self.port,
        );

        // Create shutdown channel
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Watch the config file while the server runs. The watcher handle
        // must stay alive until serve returns.
        let _config_watcher: Option<ConfigWatcher> = match &self.config_path {
            Some(path) => match ConfigWatcher::start(
                path.clone(),
                self.state.config_ref.clone(),
                shutdown_tx.subscribe(),
            ) {
                Ok(watcher) => {
                    info!(path = %path.display(), "Watching config for changes");
                    Some(watcher)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to start config watcher, live reload disabled");
                    None
                }
            },
            None => None,
        };

        let app = build_router(Arc::clone(&self.state));

        let listener = GatewayListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Gateway listening");

        // Run server with graceful shutdown
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<ClientConn>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
