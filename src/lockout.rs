//! Failed-login lockout guard.
//!
//! Counts failed logins per caller key and locks the key for a fixed period
//! once the threshold is reached. Keys are `ip|email`, so one abusive address
//! cannot lock an account out for everybody else.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{deadline, RateLimitConfig};
use crate::credentials::normalize_email;

/// Threshold and lockout length.
#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub lockout: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

impl From<&RateLimitConfig> for LockoutPolicy {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            lockout: config.lockout(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailedAttempts {
    count: u32,
    locked_until: Option<Instant>,
    last_failure: Instant,
}

/// Result of [`LockoutGuard::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub locked: bool,
    pub retry_after: Duration,
}

impl LockStatus {
    fn unlocked() -> Self {
        Self {
            locked: false,
            retry_after: Duration::ZERO,
        }
    }

    fn locked_until(until: Instant, now: Instant) -> Self {
        Self {
            locked: true,
            retry_after: until - now,
        }
    }
}

/// Result of [`LockoutGuard::record_failure`] and [`LockoutGuard::begin_attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// This failure crossed the threshold
    pub locked_now: bool,
    pub attempts_remaining: u32,
}

/// Concurrent map of failure counters. Every mutation of a key happens under
/// that key's shard lock, so concurrent failures are never lost.
pub struct LockoutGuard {
    records: DashMap<String, FailedAttempts>,
    policy: LockoutPolicy,
}

fn fresh(now: Instant) -> FailedAttempts {
    FailedAttempts {
        count: 0,
        locked_until: None,
        last_failure: now,
    }
}

impl Default for LockoutGuard {
    fn default() -> Self {
        Self::new(LockoutPolicy::default())
    }
}

impl LockoutGuard {
    pub fn new(policy: LockoutPolicy) -> Self {
        Self {
            records: DashMap::new(),
            policy,
        }
    }

    /// Rate-limit key for a login attempt.
    pub fn key(ip: &str, email: &str) -> String {
        format!("{}|{}", ip, normalize_email(email))
    }

    /// Is `key` currently locked? A lock whose time has passed is dropped
    /// together with its counter.
    pub fn check(&self, key: &str) -> LockStatus {
        let now = Instant::now();
        let expired = match self.records.get(key) {
            Some(record) => match record.locked_until {
                Some(until) if until > now => return LockStatus::locked_until(until, now),
                Some(_) => true,
                None => false,
            },
            None => false,
        };

        if expired
            && self
                .records
                .remove_if(key, |_, r| r.locked_until.is_some_and(|u| u <= now))
                .is_some()
        {
            debug!(key, "lockout expired, counter reset");
        }

        LockStatus::unlocked()
    }

    /// Count one failed attempt and lock the key when the threshold is hit.
    pub fn record_failure(&self, key: &str) -> FailureOutcome {
        let now = Instant::now();
        let mut entry = self.records.entry(key.to_string()).or_insert_with(|| fresh(now));
        let outcome = self.count_failure(entry.value_mut(), now);
        drop(entry);
        self.log_lock(key, outcome);
        outcome
    }

    /// Reserve one attempt for `key` before its password is checked.
    ///
    /// The lock check and the increment happen under the same entry lock, so
    /// concurrent logins can never evaluate more than `max_attempts` passwords
    /// per lockout window. A locked key is refused with its remaining time.
    /// The returned outcome is what a failure reports; a successful login
    /// calls [`LockoutGuard::clear`], a misconfigured one
    /// [`LockoutGuard::release_attempt`].
    pub fn begin_attempt(&self, key: &str) -> Result<FailureOutcome, LockStatus> {
        let now = Instant::now();
        let mut entry = self.records.entry(key.to_string()).or_insert_with(|| fresh(now));
        let record = entry.value_mut();
        if let Some(until) = record.locked_until.filter(|u| *u > now) {
            return Err(LockStatus::locked_until(until, now));
        }
        let outcome = self.count_failure(record, now);
        drop(entry);
        self.log_lock(key, outcome);
        Ok(outcome)
    }

    /// Give back an attempt reserved by [`LockoutGuard::begin_attempt`] that
    /// was never a password guess.
    pub fn release_attempt(&self, key: &str) {
        let mut emptied = false;
        if let Some(mut record) = self.records.get_mut(key) {
            record.count = record.count.saturating_sub(1);
            if record.count < self.policy.max_attempts {
                record.locked_until = None;
            }
            emptied = record.count == 0;
        }
        if emptied {
            self.records.remove_if(key, |_, r| r.count == 0);
        }
    }

    fn count_failure(&self, record: &mut FailedAttempts, now: Instant) -> FailureOutcome {
        if record.locked_until.is_some_and(|u| u <= now) {
            record.count = 0;
            record.locked_until = None;
        }

        record.count = record.count.saturating_add(1);
        record.last_failure = now;

        let mut locked_now = false;
        if record.count >= self.policy.max_attempts && record.locked_until.is_none() {
            record.locked_until = Some(deadline(now, self.policy.lockout));
            locked_now = true;
        }

        FailureOutcome {
            locked_now,
            attempts_remaining: self.policy.max_attempts.saturating_sub(record.count),
        }
    }

    fn log_lock(&self, key: &str, outcome: FailureOutcome) {
        if outcome.locked_now {
            warn!(
                key,
                lockout_secs = self.policy.lockout.as_secs(),
                "too many failed logins, key locked"
            );
        }
    }

    /// Forget all failures for `key` (successful login).
    pub fn clear(&self, key: &str) {
        self.records.remove(key);
    }

    /// Drop expired locks and unlocked counters idle for a full lockout
    /// window. Locks one shard at a time.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle_limit = self.policy.lockout;
        let mut removed = 0;
        self.records.retain(|_, record| {
            let keep = match record.locked_until {
                Some(until) => until > now,
                None => now.duration_since(record.last_failure) < idle_limit,
            };
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
