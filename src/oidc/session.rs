//! Session and in-flight-authorization storage.
//!
//! Both stores are process-local concurrent maps with two eviction paths: a
//! detached timer per entry and a lazy check on read. The two paths compute
//! the same cutoff instant and removals are idempotent, so it never matters
//! which one fires first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use rand::RngExt as _;
use tokio::time::Instant;

use crate::oidc::client::Userinfo;

/// How long an authorization attempt may stay in flight before its `state`
/// token stops being honored at the callback.
pub const PENDING_AUTH_TTL: Duration = Duration::from_secs(600);

fn random_token<const BYTES: usize>() -> String {
    let bytes: [u8; BYTES] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

// ==== authenticated sessions ====

#[derive(Debug, Clone)]
struct SessionEntry {
    userinfo: Userinfo,
    created_at: Instant,
}

/// Store of authenticated sessions.
///
/// The TTL is a single shared value; the cutoff of every entry is always
/// computed as `created_at` plus the *current* TTL, so changing the TTL on
/// config reload retroactively shifts the expiry of live sessions. That is
/// a deliberate product decision: the TTL tracks current policy, not the
/// policy at login time.
#[derive(Debug)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, SessionEntry>>,
    age_seconds: Arc<AtomicU64>,
}

impl SessionStore {
    /// Creates an empty store. The TTL starts at zero and is set from
    /// config before any session is created.
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            age_seconds: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Updates the shared TTL. Called on every OIDC request because the
    /// config may have been hot-reloaded.
    pub fn set_age_seconds(&self, seconds: u64) {
        self.age_seconds.store(seconds, Ordering::Relaxed);
    }

    /// The current TTL in seconds.
    pub fn age_seconds(&self) -> u64 {
        self.age_seconds.load(Ordering::Relaxed)
    }

    /// Stores a userinfo under a fresh session id and returns the id.
    ///
    /// The id is 64 random bytes, URL-safe base64. Uniqueness is only
    /// required against currently live ids, so a collision simply redraws.
    pub fn set_userinfo(&self, userinfo: Userinfo) -> String {
        let mut session_id = random_token::<64>();
        while self.sessions.contains_key(&session_id) {
            session_id = random_token::<64>();
        }
        let created_at = Instant::now();
        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                userinfo,
                created_at,
            },
        );
        self.spawn_expiry_timer(session_id.clone(), created_at);
        session_id
    }

    /// Looks a session up, returning its userinfo only while the session is
    /// within the current TTL. An expired entry is evicted on the spot even
    /// if its timer has not fired yet.
    pub fn find_valid_userinfo(&self, session_id: &str) -> Option<Userinfo> {
        let (userinfo, created_at) = {
            let entry = self.sessions.get(session_id)?;
            (entry.userinfo.clone(), entry.created_at)
        };
        if self.is_live(created_at) {
            Some(userinfo)
        } else {
            self.sessions
                .remove_if(session_id, |_, entry| entry.created_at == created_at);
            None
        }
    }

    /// Number of stored sessions, expired-but-unevicted entries included.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no sessions are stored.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn is_live(&self, created_at: Instant) -> bool {
        match self.cutoff(created_at) {
            Some(cutoff) => Instant::now() <= cutoff,
            None => true,
        }
    }

    fn cutoff(&self, created_at: Instant) -> Option<Instant> {
        created_at.checked_add(Duration::from_secs(self.age_seconds.load(Ordering::Relaxed)))
    }

    // The timer re-checks the cutoff when it wakes: if the TTL was raised
    // while it slept, it re-arms instead of evicting, keeping the timer path
    // and the read path in agreement. Detached, so it never holds up
    // process shutdown.
    fn spawn_expiry_timer(&self, session_id: String, created_at: Instant) {
        let sessions = Arc::clone(&self.sessions);
        let age_seconds = Arc::clone(&self.age_seconds);
        tokio::spawn(async move {
            loop {
                let ttl = Duration::from_secs(age_seconds.load(Ordering::Relaxed));
                let Some(cutoff) = created_at.checked_add(ttl) else {
                    // TTL so large the entry is effectively immortal; leave
                    // eviction to the lazy path.
                    return;
                };
                if Instant::now() >= cutoff {
                    break;
                }
                tokio::time::sleep_until(cutoff).await;
            }
            sessions.remove_if(&session_id, |_, entry| entry.created_at == created_at);
        });
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

// ==== in-flight authorization attempts ====

/// Everything remembered about one authorization attempt, keyed by the
/// opaque `state` token given to the provider.
#[derive(Debug, Clone)]
pub struct PendingAuth {
    /// The PKCE verifier minted for this attempt.
    pub code_verifier: String,
    /// Path plus query to return the browser to after login.
    pub return_to: Option<String>,
    /// Session-forward target captured from the original request, if any.
    pub session_forward_url: Option<String>,
    created_at: Instant,
}

/// Store of authorization attempts awaiting their callback.
#[derive(Debug)]
pub struct PendingAuthStore {
    pending: Arc<DashMap<String, PendingAuth>>,
}

impl PendingAuthStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Records an attempt and returns the `state` token identifying it.
    pub fn insert(
        &self,
        code_verifier: String,
        return_to: Option<String>,
        session_forward_url: Option<String>,
    ) -> String {
        let mut state = random_token::<32>();
        while self.pending.contains_key(&state) {
            state = random_token::<32>();
        }
        let created_at = Instant::now();
        self.pending.insert(
            state.clone(),
            PendingAuth {
                code_verifier,
                return_to,
                session_forward_url,
                created_at,
            },
        );
        self.spawn_expiry_timer(state.clone(), created_at);
        state
    }

    /// Removes and returns the attempt for a `state` token. Single use: a
    /// second call with the same token returns `None`, as does a token past
    /// its TTL.
    pub fn take(&self, state: &str) -> Option<PendingAuth> {
        let (_, attempt) = self.pending.remove(state)?;
        let expired = attempt
            .created_at
            .checked_add(PENDING_AUTH_TTL)
            .is_some_and(|cutoff| Instant::now() > cutoff);
        if expired { None } else { Some(attempt) }
    }

    /// Number of attempts currently awaiting a callback.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when no attempts are in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn spawn_expiry_timer(&self, state: String, created_at: Instant) {
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            if let Some(cutoff) = created_at.checked_add(PENDING_AUTH_TTL) {
                tokio::time::sleep_until(cutoff).await;
                pending.remove_if(&state, |_, attempt| attempt.created_at == created_at);
            }
        });
    }
}

impl Default for PendingAuthStore {
    fn default() -> Self {
        Self::new()
    }
}
