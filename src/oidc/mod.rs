//! OpenID Connect support: provider client, per-request flow, and the
//! session/attempt stores.

pub mod client;
pub mod flow;
pub mod session;

pub use client::{OidcClient, OidcClientParams, Userinfo};
pub use flow::{FlowOutcome, OidcFlow};
pub use session::{PendingAuthStore, SessionStore};
