//! In-memory session store for admin dashboard authentication.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::deadline;

/// Default session TTL: 24 hours.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Random bytes per token (hex-encoded to 64 characters).
const TOKEN_BYTES: usize = 32;

/// An authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    /// Lower-cased admin email
    pub identity: String,
    pub ip: String,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Monotonic expiry; the session is valid while `now < expires_at`.
    pub expires_at: Instant,
}

impl Session {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Caller details recorded at login.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub identity: String,
    pub ip: String,
    pub user_agent: Option<String>,
}

/// Why [`SessionStore::verify`] refused a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidOrExpired,
    IpMismatch,
}

/// Outcome of [`SessionStore::verify`].
#[derive(Debug, Clone)]
pub enum Verification {
    Valid(Session),
    Invalid(Rejection),
}

/// Generate a session token: 256 bits from the OS CSPRNG, hex-encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Thread-safe in-memory session store.
///
/// Every read of a session's validity goes through [`SessionStore::get`];
/// all mutations of one token happen under its shard lock.
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert a session under a caller-supplied token.
    pub fn create(&self, token: String, payload: NewSession) -> Session {
        let now = Utc::now();
        let session = Session {
            token: token.clone(),
            identity: payload.identity,
            ip: payload.ip,
            user_agent: payload.user_agent,
            created_at: now,
            last_activity: now,
            expires_at: deadline(Instant::now(), self.ttl),
        };
        debug!(identity = %session.identity, ip = %session.ip, "session created");
        self.sessions.insert(token, session.clone());
        session
    }

    /// Create a session with a freshly generated token.
    pub fn create_session(&self, payload: NewSession) -> Session {
        self.create(generate_token(), payload)
    }

    /// Look up a live session, touching its `last_activity`. Expired sessions
    /// are removed and reported as absent.
    pub fn get(&self, token: &str) -> Option<Session> {
        let now = Instant::now();
        match self.sessions.entry(token.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    let session = occupied.remove();
                    debug!(identity = %session.identity, "session expired on lookup");
                    None
                } else {
                    let session = occupied.get_mut();
                    session.last_activity = Utc::now();
                    Some(session.clone())
                }
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Validate a token for `caller_ip`. With `strict_ip_check` a session
    /// presented from another IP is destroyed.
    pub fn verify(&self, token: &str, caller_ip: &str, strict_ip_check: bool) -> Verification {
        let Some(session) = self.get(token) else {
            return Verification::Invalid(Rejection::InvalidOrExpired);
        };

        if strict_ip_check && session.ip != caller_ip {
            self.delete(token);
            info!(
                identity = %session.identity,
                session_ip = %session.ip,
                caller_ip,
                "session presented from a different IP, revoked"
            );
            return Verification::Invalid(Rejection::IpMismatch);
        }

        Verification::Valid(session)
    }

    /// Push expiry to `now + duration` (default: the store TTL). False when
    /// the session is gone or already expired.
    pub fn extend(&self, token: &str, duration: Option<Duration>) -> bool {
        let now = Instant::now();
        match self.sessions.entry(token.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.remove();
                    return false;
                }
                occupied.get_mut().expires_at = deadline(now, duration.unwrap_or(self.ttl));
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Remove a session (logout).
    pub fn delete(&self, token: &str) -> bool {
        match self.sessions.remove(token) {
            Some((_, session)) => {
                debug!(
                    identity = %session.identity,
                    ip = %session.ip,
                    created_at = %session.created_at,
                    "session deleted"
                );
                true
            }
            None => false,
        }
    }

    /// Remove every session belonging to `identity`. Returns how many.
    pub fn invalidate_all_for_identity(&self, identity: &str) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            if session.identity == identity {
                debug!(identity, ip = %session.ip, "session invalidated");
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            info!(identity, removed, "invalidated all sessions for identity");
        }
        removed
    }

    /// Remove all expired sessions. Locks one shard at a time, so lookups on
    /// other shards proceed during the pass.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            if session.is_expired(now) {
                debug!(
                    identity = %session.identity,
                    ip = %session.ip,
                    created_at = %session.created_at,
                    last_activity = %session.last_activity,
                    "session expired"
                );
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(removed, "expired sessions purged");
        }
        removed
    }

    /// Number of stored sessions, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
