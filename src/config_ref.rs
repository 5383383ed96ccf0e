//! Live config handle.
//!
//! Requests read whatever snapshot is installed at the moment they arrive;
//! a reload swaps the pointer and in-flight requests keep the snapshot they
//! started with. The handle also owns the discovered OIDC client so that
//! concurrent first requests share a single discovery round trip.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::OnceCell;

use crate::Result;
use crate::config::{NormalizedConfig, OidcConfig};
use crate::oidc::{OidcClient, OidcClientParams};

/// Cloneable handle to the active config snapshot.
#[derive(Clone)]
pub struct ConfigRef {
    inner: Arc<Inner>,
}

struct Inner {
    state: RwLock<State>,
    /// HTTP client reused across provider fetches.
    http: reqwest::Client,
}

#[derive(Default)]
struct State {
    config: Option<Arc<NormalizedConfig>>,
    oidc_slot: Option<OidcSlot>,
}

/// One generation of discovered OIDC client, keyed by the parameters that
/// produced it.
struct OidcSlot {
    params: OidcClientParams,
    cell: Arc<OnceCell<Arc<OidcClient>>>,
}

impl ConfigRef {
    /// Creates a handle with no snapshot installed.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                http: reqwest::Client::new(),
            }),
        }
    }

    /// Current snapshot, or `None` until the first successful load.
    pub fn get(&self) -> Option<Arc<NormalizedConfig>> {
        self.inner.state.read().config.clone()
    }

    /// Install (or clear) the active snapshot.
    ///
    /// The discovered OIDC client survives the swap when the provider
    /// parameters are unchanged. Otherwise the slot is replaced and the
    /// next OIDC request discovers against the new provider.
    pub fn set(&self, config: Option<Arc<NormalizedConfig>>) {
        let mut state = self.inner.state.write();
        let next_params = config
            .as_deref()
            .and_then(|c| c.openid_connect.as_ref())
            .map(OidcClientParams::from_config);
        state.oidc_slot = match (next_params, state.oidc_slot.take()) {
            (None, _) => None,
            (Some(params), Some(slot)) if slot.params == params => Some(slot),
            (Some(params), _) => Some(OidcSlot {
                params,
                cell: Arc::new(OnceCell::new()),
            }),
        };
        state.config = config;
    }

    /// The discovered client for an OIDC config block.
    ///
    /// Discovery runs at most once per parameter set; concurrent callers
    /// await the same attempt. A failed attempt leaves the slot empty, so
    /// the next request retries instead of pinning the failure.
    pub async fn oidc_client(&self, config: &OidcConfig) -> Result<Arc<OidcClient>> {
        let params = OidcClientParams::from_config(config);
        let http = self.inner.http.clone();
        let cached = {
            let state = self.inner.state.read();
            match &state.oidc_slot {
                Some(slot) if slot.params == params => Some(Arc::clone(&slot.cell)),
                _ => None,
            }
        };
        let Some(cell) = cached else {
            // The snapshot was swapped between the caller reading it and
            // this call. Serve the stale request with an uncached client
            // rather than poisoning the new generation's slot.
            let client = OidcClient::discover(http, params).await?;
            return Ok(Arc::new(client));
        };
        let client = cell
            .get_or_try_init(|| async move {
                OidcClient::discover(http, params).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(client))
    }
}

impl Default for ConfigRef {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        OidcCookie, OidcRedirect, OidcSession, Rejection,
    };

    fn oidc_config(issuer_url: &str) -> OidcConfig {
        OidcConfig {
            issuer_url: issuer_url.into(),
            client_id: "gateway".into(),
            client_secret: "s3cret".into(),
            redirect: OidcRedirect {
                uri: "http://localhost:8080/callback".into(),
                path: "/callback".into(),
            },
            allow_userinfos: vec![],
            session: OidcSession {
                age_seconds: 60,
                custom_http_header: None,
                forward: None,
                cookie: OidcCookie {
                    name: "session_id".into(),
                    http_only: true,
                },
            },
            log: None,
        }
    }

    fn config_with_oidc(issuer_url: Option<&str>) -> Arc<NormalizedConfig> {
        Arc::new(NormalizedConfig {
            basic_auth_users: None,
            allow_paths: None,
            rejection: Rejection::SocketClose,
            openid_connect: issuer_url.map(oidc_config),
        })
    }

    fn slot_cell(config_ref: &ConfigRef) -> Option<Arc<OnceCell<Arc<OidcClient>>>> {
        config_ref
            .inner
            .state
            .read()
            .oidc_slot
            .as_ref()
            .map(|slot| Arc::clone(&slot.cell))
    }

    #[test]
    fn starts_empty_and_swaps_snapshots() {
        let config_ref = ConfigRef::new();
        assert!(config_ref.get().is_none());

        let snapshot = config_with_oidc(None);
        config_ref.set(Some(Arc::clone(&snapshot)));
        assert!(Arc::ptr_eq(&config_ref.get().unwrap(), &snapshot));

        config_ref.set(None);
        assert!(config_ref.get().is_none());
    }

    #[test]
    fn clones_share_the_snapshot() {
        let config_ref = ConfigRef::new();
        let clone = config_ref.clone();
        config_ref.set(Some(config_with_oidc(None)));
        assert!(clone.get().is_some());
    }

    // GIVEN a reload with identical provider params THEN the client slot
    // survives, so no rediscovery happens
    #[test]
    fn unchanged_oidc_params_keep_the_slot() {
        let config_ref = ConfigRef::new();
        config_ref.set(Some(config_with_oidc(Some("https://idp.example.com"))));
        let before = slot_cell(&config_ref).unwrap();

        config_ref.set(Some(config_with_oidc(Some("https://idp.example.com"))));
        let after = slot_cell(&config_ref).unwrap();

        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn changed_oidc_params_replace_the_slot() {
        let config_ref = ConfigRef::new();
        config_ref.set(Some(config_with_oidc(Some("https://idp.example.com"))));
        let before = slot_cell(&config_ref).unwrap();

        config_ref.set(Some(config_with_oidc(Some("https://other.example.com"))));
        let after = slot_cell(&config_ref).unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn dropping_oidc_clears_the_slot() {
        let config_ref = ConfigRef::new();
        config_ref.set(Some(config_with_oidc(Some("https://idp.example.com"))));
        assert!(slot_cell(&config_ref).is_some());

        config_ref.set(Some(config_with_oidc(None)));
        assert!(slot_cell(&config_ref).is_none());
    }
}
