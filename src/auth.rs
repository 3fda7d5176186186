//! Auth service: login, verify and logout over the credential store, the
//! lockout guard and the session store.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::credentials::{AdminIdentity, CredentialError, CredentialStore};
use crate::lockout::{FailureOutcome, LockoutGuard, LockoutPolicy};
use crate::session::{NewSession, Rejection, Session, SessionStore, Verification};

/// Errors surfaced by [`AuthService`]. Wrong passwords and dead sessions are
/// ordinary values here, not panics.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Email and password are required")]
    MissingFields,

    #[error("No session token provided")]
    MissingToken,

    #[error("Invalid credentials")]
    InvalidCredentials {
        attempts_remaining: u32,
        /// This failure triggered a lockout
        locked_now: bool,
    },

    #[error("Too many failed attempts. Try again in {} minutes.", retry_minutes(.retry_after))]
    LockedOut { retry_after: Duration },

    #[error("Invalid or expired session")]
    InvalidSession,

    #[error("IP mismatch")]
    IpMismatch,

    #[error("Server misconfiguration: {0}")]
    Misconfigured(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Short machine label, used for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingFields => "missing_fields",
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidCredentials { .. } => "invalid_credentials",
            AuthError::LockedOut { .. } => "locked_out",
            AuthError::InvalidSession => "invalid_session",
            AuthError::IpMismatch => "ip_mismatch",
            AuthError::Misconfigured(_) => "misconfigured",
            AuthError::Internal(_) => "internal",
        }
    }

    /// Whole minutes until a locked-out caller may retry.
    pub fn retry_after_minutes(&self) -> Option<u64> {
        match self {
            AuthError::LockedOut { retry_after } => Some(retry_minutes(retry_after)),
            _ => None,
        }
    }
}

fn retry_minutes(retry_after: &Duration) -> u64 {
    retry_after.as_secs().div_ceil(60).max(1)
}

impl From<Rejection> for AuthError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::InvalidOrExpired => AuthError::InvalidSession,
            Rejection::IpMismatch => AuthError::IpMismatch,
        }
    }
}

/// Who is calling, as seen by the HTTP layer.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: None,
        }
    }
}

/// Display-safe view of an administrator. Never carries the hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserView {
    pub username: String,
    pub email: String,
}

impl From<&AdminIdentity> for UserView {
    fn from(identity: &AdminIdentity) -> Self {
        Self {
            username: identity.display_name.clone(),
            email: identity.email.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginSuccess {
    pub token: String,
    pub user: UserView,
    pub expires_in: Duration,
}

#[derive(Debug, Clone)]
pub struct VerifySuccess {
    pub user: UserView,
    pub expires_in: Duration,
}

pub struct AuthService {
    credentials: Arc<CredentialStore>,
    lockouts: LockoutGuard,
    sessions: SessionStore,
    strict_ip_check: bool,
}

impl AuthService {
    pub fn new(
        credentials: Arc<CredentialStore>,
        lockouts: LockoutGuard,
        sessions: SessionStore,
        strict_ip_check: bool,
    ) -> Self {
        Self {
            credentials,
            lockouts,
            sessions,
            strict_ip_check,
        }
    }

    /// Build the credential store and both in-memory stores from config.
    pub fn from_config(config: &Config) -> Result<Self, CredentialError> {
        let credentials = CredentialStore::from_config(config)?;
        Ok(Self::new(
            Arc::new(credentials),
            LockoutGuard::new(LockoutPolicy::from(&config.rate_limit)),
            SessionStore::new(config.session.duration()),
            config.session.strict_ip_check,
        ))
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn lockouts(&self) -> &LockoutGuard {
        &self.lockouts
    }

    /// Exchange an email and password for a session token.
    ///
    /// Each attempt is reserved against the lockout key before any password
    /// comparison, so a locked key is refused outright and concurrent guesses
    /// share one budget. Unknown emails and wrong passwords fail identically.
    pub async fn login(
        &self,
        email: &str,
        password: Zeroizing<String>,
        client: &ClientInfo,
    ) -> Result<LoginSuccess, AuthError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(AuthError::MissingFields);
        }

        let key = LockoutGuard::key(&client.ip, email);
        let attempt = match self.lockouts.begin_attempt(&key) {
            Ok(attempt) => attempt,
            Err(status) => {
                warn!(ip = %client.ip, email, "login refused, key is locked out");
                return Err(AuthError::LockedOut {
                    retry_after: status.retry_after,
                });
            }
        };

        if !self.credentials.is_configured() {
            self.lockouts.release_attempt(&key);
            return Err(AuthError::Misconfigured(
                "no administrator accounts are configured; set PMP_ADMIN_EMAIL and \
                 PMP_ADMIN_PASSWORD_HASH, or enable setup mode for first-run bootstrap"
                    .to_string(),
            ));
        }

        let Some(identity) = self.credentials.find_by_email(email).cloned() else {
            return Err(self.reject(attempt, client, email));
        };

        let checked = tokio::task::spawn_blocking({
            let identity = identity.clone();
            move || identity.verify_password(&password)
        })
        .await;

        match checked {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => return Err(self.reject(attempt, client, email)),
            Ok(Err(e)) => {
                self.lockouts.release_attempt(&key);
                error!(email = %identity.email, error = %e, "credential configuration error");
                return Err(AuthError::Misconfigured(e.to_string()));
            }
            Err(e) => {
                self.lockouts.release_attempt(&key);
                return Err(AuthError::Internal(format!(
                    "password verification task failed: {e}"
                )));
            }
        }

        self.lockouts.clear(&key);
        let session = self.sessions.create_session(NewSession {
            identity: identity.email.clone(),
            ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
        });
        info!(email = %identity.email, ip = %client.ip, "admin logged in");

        Ok(LoginSuccess {
            token: session.token,
            user: UserView::from(&identity),
            expires_in: self.sessions.ttl(),
        })
    }

    fn reject(&self, attempt: FailureOutcome, client: &ClientInfo, email: &str) -> AuthError {
        warn!(
            ip = %client.ip,
            email,
            attempts_remaining = attempt.attempts_remaining,
            "failed login"
        );
        AuthError::InvalidCredentials {
            attempts_remaining: attempt.attempts_remaining,
            locked_now: attempt.locked_now,
        }
    }

    /// Validate a token and slide its expiry forward.
    pub fn verify(&self, token: &str, caller_ip: &str) -> Result<VerifySuccess, AuthError> {
        let session = self.authenticate(token, caller_ip)?;
        if !self.sessions.extend(token, None) {
            return Err(AuthError::InvalidSession);
        }
        Ok(VerifySuccess {
            user: self.user_for(&session),
            expires_in: self.sessions.ttl(),
        })
    }

    /// End a session. Unknown or missing tokens are not an error.
    pub fn logout(&self, token: Option<&str>) {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return;
        };
        match self.sessions.get(token) {
            Some(session) => {
                self.sessions.delete(token);
                info!(email = %session.identity, ip = %session.ip, "admin logged out");
            }
            None => debug!("logout for unknown or expired session"),
        }
    }

    /// Invalidate every session of the caller's identity. Requires a valid
    /// token; returns how many sessions were removed.
    pub fn logout_everywhere(&self, token: &str, caller_ip: &str) -> Result<usize, AuthError> {
        let session = self.authenticate(token, caller_ip)?;
        let removed = self.sessions.invalidate_all_for_identity(&session.identity);
        info!(email = %session.identity, removed, "logged out everywhere");
        Ok(removed)
    }

    fn authenticate(&self, token: &str, caller_ip: &str) -> Result<Session, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        match self.sessions.verify(token, caller_ip, self.strict_ip_check) {
            Verification::Valid(session) => Ok(session),
            Verification::Invalid(rejection) => Err(rejection.into()),
        }
    }

    /// Identities removed from config keep their sessions until expiry.
    fn user_for(&self, session: &Session) -> UserView {
        match self.credentials.find_by_email(&session.identity) {
            Some(identity) => UserView::from(identity),
            None => UserView {
                username: session.identity.clone(),
                email: session.identity.clone(),
            },
        }
    }

    /// Purge expired sessions and stale lockout records. Returns
    /// `(sessions, lockouts)` removed.
    pub fn sweep(&self) -> (usize, usize) {
        let sessions = self.sessions.cleanup_expired();
        let lockouts = self.lockouts.sweep();
        if sessions + lockouts > 0 {
            debug!(sessions, lockouts, "maintenance sweep");
        }
        (sessions, lockouts)
    }

    /// Run [`AuthService::sweep`] every `interval` until the handle is aborted.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::PasswordHash;

    const EMAIL: &str = "admin@pmpuzzle.com";
    const PASSWORD: &str = "correct-password";

    fn service_with(max_attempts: u32, lockout_secs: u64, ttl_secs: u64, strict: bool) -> AuthService {
        let identity = AdminIdentity::new(
            EMAIL,
            "PM Admin",
            Some(PasswordHash::bcrypt(PASSWORD, 4).unwrap()),
        );
        AuthService::new(
            Arc::new(CredentialStore::new([identity])),
            LockoutGuard::new(LockoutPolicy {
                max_attempts,
                lockout: Duration::from_secs(lockout_secs),
            }),
            SessionStore::new(Duration::from_secs(ttl_secs)),
            strict,
        )
    }

    fn service() -> AuthService {
        service_with(5, 900, 86_400, false)
    }

    fn pw(s: &str) -> Zeroizing<String> {
        Zeroizing::new(s.to_string())
    }

    fn client(ip: &str) -> ClientInfo {
        ClientInfo::new(ip)
    }

    #[tokio::test]
    async fn test_login_success() {
        let svc = service();
        let ok = svc.login(EMAIL, pw(PASSWORD), &client("1.2.3.4")).await.unwrap();
        assert_eq!(ok.token.len(), 64);
        assert!(ok.token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(ok.expires_in, Duration::from_secs(86_400));
        assert_eq!(
            ok.user,
            UserView {
                username: "PM Admin".into(),
                email: EMAIL.into()
            }
        );
        assert_eq!(svc.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_login_email_is_case_insensitive() {
        let svc = service();
        assert!(svc
            .login("  ADMIN@pmpuzzle.com", pw(PASSWORD), &client("1.2.3.4"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let svc = service();
        assert!(matches!(
            svc.login("", pw(PASSWORD), &client("ip")).await,
            Err(AuthError::MissingFields)
        ));
        assert!(matches!(
            svc.login(EMAIL, pw(""), &client("ip")).await,
            Err(AuthError::MissingFields)
        ));
        assert!(svc.lockouts().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_email_and_wrong_password_fail_alike() {
        let svc = service();
        let unknown = svc
            .login("nobody@x.com", pw(PASSWORD), &client("1.2.3.4"))
            .await
            .unwrap_err();
        let wrong = svc.login(EMAIL, pw("nope"), &client("1.2.3.4")).await.unwrap_err();
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert!(matches!(
            wrong,
            AuthError::InvalidCredentials {
                attempts_remaining: 4,
                locked_now: false
            }
        ));
    }

    #[tokio::test]
    async fn test_sixth_attempt_locked_even_with_right_password() {
        let svc = service();
        let ip = client("1.2.3.4");
        for expected in (0..5).rev() {
            match svc.login("bad@x.com", pw("wrong"), &ip).await {
                Err(AuthError::InvalidCredentials {
                    attempts_remaining, ..
                }) => assert_eq!(attempts_remaining, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
        let err = svc.login("bad@x.com", pw(PASSWORD), &ip).await.unwrap_err();
        assert!(matches!(err, AuthError::LockedOut { .. }));
        assert!(err.retry_after_minutes().unwrap() > 0);
        assert!(err.to_string().contains("15 minutes"));
    }

    #[tokio::test]
    async fn test_lockout_is_per_ip_and_account() {
        let svc = service_with(2, 900, 60, false);
        let attacker = client("6.6.6.6");
        svc.login(EMAIL, pw("x"), &attacker).await.unwrap_err();
        svc.login(EMAIL, pw("x"), &attacker).await.unwrap_err();
        assert!(matches!(
            svc.login(EMAIL, pw(PASSWORD), &attacker).await,
            Err(AuthError::LockedOut { .. })
        ));
        // Same account from elsewhere is unaffected
        assert!(svc.login(EMAIL, pw(PASSWORD), &client("1.2.3.4")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockout_expires() {
        let svc = service_with(2, 60, 3_600, false);
        let ip = client("1.2.3.4");
        svc.login(EMAIL, pw("x"), &ip).await.unwrap_err();
        svc.login(EMAIL, pw("x"), &ip).await.unwrap_err();
        assert!(matches!(
            svc.login(EMAIL, pw(PASSWORD), &ip).await,
            Err(AuthError::LockedOut { .. })
        ));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(svc.login(EMAIL, pw(PASSWORD), &ip).await.is_ok());
    }

    #[tokio::test]
    async fn test_success_clears_failures() {
        let svc = service_with(3, 900, 60, false);
        let ip = client("1.2.3.4");
        svc.login(EMAIL, pw("x"), &ip).await.unwrap_err();
        svc.login(EMAIL, pw("x"), &ip).await.unwrap_err();
        svc.login(EMAIL, pw(PASSWORD), &ip).await.unwrap();
        match svc.login(EMAIL, pw("x"), &ip).await {
            Err(AuthError::InvalidCredentials {
                attempts_remaining, ..
            }) => assert_eq!(attempts_remaining, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unconfigured_store_is_misconfiguration() {
        let svc = AuthService::new(
            Arc::new(CredentialStore::default()),
            LockoutGuard::default(),
            SessionStore::default(),
            false,
        );
        assert!(matches!(
            svc.login(EMAIL, pw(PASSWORD), &client("ip")).await,
            Err(AuthError::Misconfigured(_))
        ));
        assert!(svc.lockouts().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_guesses_share_one_budget() {
        let svc = Arc::new(service_with(5, 900, 60, false));
        let guesses: Vec<_> = (0..40)
            .map(|i| {
                let svc = Arc::clone(&svc);
                tokio::spawn(async move {
                    svc.login(EMAIL, pw(&format!("guess-{i}")), &client("6.6.6.6"))
                        .await
                })
            })
            .collect();

        let mut evaluated = 0;
        let mut locked_out = 0;
        for guess in guesses {
            match guess.await.unwrap() {
                Err(AuthError::InvalidCredentials { .. }) => evaluated += 1,
                Err(AuthError::LockedOut { .. }) => locked_out += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(evaluated, 5);
        assert_eq!(locked_out, 35);

        // The right password is refused once the budget is spent
        assert!(matches!(
            svc.login(EMAIL, pw(PASSWORD), &client("6.6.6.6")).await,
            Err(AuthError::LockedOut { .. })
        ));
    }

    #[tokio::test]
    async fn test_identity_without_password_is_misconfiguration() {
        let svc = AuthService::new(
            Arc::new(CredentialStore::new([AdminIdentity::new(EMAIL, "A", None)])),
            LockoutGuard::default(),
            SessionStore::default(),
            false,
        );
        assert!(matches!(
            svc.login(EMAIL, pw(PASSWORD), &client("ip")).await,
            Err(AuthError::Misconfigured(_))
        ));
        // Misconfiguration is not charged to the caller
        assert!(svc.lockouts().is_empty());
    }

    #[tokio::test]
    async fn test_verify_returns_user_and_ttl() {
        let svc = service();
        let token = svc.login(EMAIL, pw(PASSWORD), &client("1.2.3.4")).await.unwrap().token;
        let ok = svc.verify(&token, "1.2.3.4").unwrap();
        assert_eq!(ok.user.email, EMAIL);
        assert_eq!(ok.expires_in, Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn test_verify_rejects_missing_and_unknown_tokens() {
        let svc = service();
        assert!(matches!(svc.verify("", "ip"), Err(AuthError::MissingToken)));
        assert!(matches!(
            svc.verify("deadbeef", "ip"),
            Err(AuthError::InvalidSession)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_slides_expiry() {
        let svc = service_with(5, 900, 100, false);
        let token = svc.login(EMAIL, pw(PASSWORD), &client("ip")).await.unwrap().token;

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(99)).await;
            assert!(svc.verify(&token, "ip").is_ok());
        }
        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(matches!(
            svc.verify(&token, "ip"),
            Err(AuthError::InvalidSession)
        ));
    }

    #[tokio::test]
    async fn test_strict_ip_mismatch_revokes_session() {
        let svc = service_with(5, 900, 3_600, true);
        let token = svc.login(EMAIL, pw(PASSWORD), &client("1.2.3.4")).await.unwrap().token;

        let err = svc.verify(&token, "9.9.9.9").unwrap_err();
        assert!(matches!(err, AuthError::IpMismatch));
        assert_eq!(err.to_string(), "IP mismatch");
        assert!(matches!(
            svc.verify(&token, "1.2.3.4"),
            Err(AuthError::InvalidSession)
        ));
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let svc = service();
        let token = svc.login(EMAIL, pw(PASSWORD), &client("ip")).await.unwrap().token;
        svc.logout(Some(&token));
        svc.logout(Some(&token));
        svc.logout(Some("never-issued"));
        svc.logout(None);
        assert!(svc.sessions().is_empty());
        assert!(matches!(svc.verify(&token, "ip"), Err(AuthError::InvalidSession)));
    }

    #[tokio::test]
    async fn test_logout_everywhere() {
        let svc = service();
        let a = svc.login(EMAIL, pw(PASSWORD), &client("1.1.1.1")).await.unwrap().token;
        let b = svc.login(EMAIL, pw(PASSWORD), &client("2.2.2.2")).await.unwrap().token;
        assert_eq!(svc.logout_everywhere(&a, "1.1.1.1").unwrap(), 2);
        assert!(svc.verify(&b, "2.2.2.2").is_err());
        assert!(matches!(
            svc.logout_everywhere(&a, "1.1.1.1"),
            Err(AuthError::InvalidSession)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_sweeps_both_stores() {
        let svc = Arc::new(service_with(5, 30, 10, false));
        svc.login(EMAIL, pw(PASSWORD), &client("ip")).await.unwrap();
        svc.login(EMAIL, pw("x"), &client("other")).await.unwrap_err();
        assert_eq!(svc.sessions().len(), 1);
        assert_eq!(svc.lockouts().len(), 1);

        let task = svc.spawn_maintenance(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(svc.sessions().is_empty());
        assert!(svc.lockouts().is_empty());
        task.abort();
    }
}
