//! Gateway server implementation

pub mod authorize;
pub mod basic_auth;
pub mod handler;
pub mod reject;
pub mod server;

pub use handler::{AppState, build_router};
pub use server::{ClientConn, CloseSwitch, ConnectionClosed, GatewayListener, GatewayServer};
