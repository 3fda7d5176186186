//! Configuration for the PM Puzzle admin auth service

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use crate::credentials::CredentialError;

/// Email used when only a password or hash is supplied through the environment.
pub const DEFAULT_ADMIN_EMAIL: &str = "admin@pmpuzzle.com";

/// Upper bound for session and lockout durations (one year).
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `now + duration`, clamped to [`MAX_DURATION`] so it cannot overflow.
pub fn deadline(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration).unwrap_or_else(|| now + MAX_DURATION)
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Deployment environment. Production refuses to start in setup mode.
    #[serde(default)]
    pub environment: Environment,

    /// Allow the built-in bootstrap credential for admins without a password.
    /// Insecure; intended only for first-run setup.
    #[serde(default)]
    pub setup_mode: bool,

    /// Administrator identities
    #[serde(default)]
    pub admins: Vec<AdminAccount>,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Origins allowed by CORS. Empty means no cross-origin access.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,

    /// Take the caller IP from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a reverse proxy that sets these headers.
    #[serde(default)]
    pub trust_proxy_headers: bool,

    /// Work factor used when hashing plaintext passwords at startup.
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,

    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,

    /// Log level filter string.
    /// Set via config file or PMP_LOG_LEVEL env var. Overridden by RUST_LOG.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Development),
            "prod" | "production" => Ok(Environment::Production),
            other => Err(ConfigError::Invalid(format!(
                "unknown environment '{other}' (expected development or production)"
            ))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => f.write_str("development"),
            Environment::Production => f.write_str("production"),
        }
    }
}

/// One administrator identity as written in configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct AdminAccount {
    pub email: String,

    #[serde(default = "default_display_name")]
    pub display_name: String,

    /// Bcrypt hash (`$2b$...`) or legacy 64-character hex SHA-256 digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,

    /// Plaintext password, bcrypt-hashed at startup. Never serialized.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl fmt::Debug for AdminAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminAccount")
            .field("email", &self.email)
            .field("display_name", &self.display_name)
            .field("password_hash", &self.password_hash.as_ref().map(|_| "<set>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Session lifetime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sliding session lifetime in seconds
    #[serde(default = "default_session_duration_secs")]
    pub duration_secs: u64,

    /// How often expired sessions and stale lockout records are purged
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Reject verification from an IP other than the one that logged in
    #[serde(default)]
    pub strict_ip_check: bool,
}

impl SessionConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_session_duration_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            strict_ip_check: false,
        }
    }
}

/// Failed-login lockout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Failed attempts before the key is locked
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lockout length in seconds
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
}

impl RateLimitConfig {
    pub fn lockout(&self) -> Duration {
        Duration::from_secs(self.lockout_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lockout_secs: default_lockout_secs(),
        }
    }
}

// Default value functions for serde
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8787))
}

fn default_display_name() -> String {
    "Admin".to_string()
}

fn default_session_duration_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_lockout_secs() -> u64 {
    15 * 60
}

fn default_bcrypt_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "pmpuzzle_auth=info,tower_http=info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            environment: Environment::default(),
            setup_mode: false,
            admins: Vec::new(),
            session: SessionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cors_allowed_origins: Vec::new(),
            trust_proxy_headers: false,
            bcrypt_cost: default_bcrypt_cost(),
            metrics_enabled: default_metrics_enabled(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup (the process
    /// environment in production, a map in tests).
    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("PMP_LISTEN_ADDR") {
            config.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("PMP_LISTEN_ADDR: {e}")))?;
        }

        if let Some(env) = lookup("PMP_ENV") {
            config.environment = env.parse()?;
        }

        if let Some(flag) = env_flag(&lookup, "PMP_SETUP_MODE")? {
            config.setup_mode = flag;
        }

        // Single admin identity from the environment
        let email = lookup("PMP_ADMIN_EMAIL").filter(|v| !v.trim().is_empty());
        let password_hash = lookup("PMP_ADMIN_PASSWORD_HASH").filter(|v| !v.trim().is_empty());
        let password = lookup("PMP_ADMIN_PASSWORD").filter(|v| !v.is_empty());
        if email.is_some() || password_hash.is_some() || password.is_some() {
            config.admins.push(AdminAccount {
                email: email.unwrap_or_else(|| DEFAULT_ADMIN_EMAIL.to_string()),
                display_name: lookup("PMP_ADMIN_NAME").unwrap_or_else(default_display_name),
                password_hash: password_hash.map(|h| h.trim().to_string()),
                password,
            });
        }

        if let Some(d) = env_duration(&lookup, "PMP_SESSION_DURATION")? {
            config.session.duration_secs = d.as_secs();
        }
        if let Some(d) = env_duration(&lookup, "PMP_SWEEP_INTERVAL")? {
            config.session.sweep_interval_secs = d.as_secs();
        }
        if let Some(flag) = env_flag(&lookup, "PMP_STRICT_IP_CHECK")? {
            config.session.strict_ip_check = flag;
        }

        if let Some(attempts) = lookup("PMP_MAX_LOGIN_ATTEMPTS") {
            config.rate_limit.max_attempts = attempts
                .trim()
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("PMP_MAX_LOGIN_ATTEMPTS: {e}")))?;
        }
        if let Some(d) = env_duration(&lookup, "PMP_LOCKOUT_DURATION")? {
            config.rate_limit.lockout_secs = d.as_secs();
        }

        if let Some(origins) = lookup("PMP_CORS_ORIGINS") {
            config.cors_allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(flag) = env_flag(&lookup, "PMP_TRUST_PROXY_HEADERS")? {
            config.trust_proxy_headers = flag;
        }

        if let Some(cost) = lookup("PMP_BCRYPT_COST") {
            config.bcrypt_cost = cost
                .trim()
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("PMP_BCRYPT_COST: {e}")))?;
        }

        if let Some(flag) = env_flag(&lookup, "PMP_METRICS")? {
            config.metrics_enabled = flag;
        }

        if let Some(level) = lookup("PMP_LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Load configuration from file if one is found, otherwise from environment
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("PMP_CONFIG") {
            return Self::from_file(&path);
        }

        for path in &["pmpuzzle_auth.toml", "/etc/pmpuzzle_auth/config.toml"] {
            if std::path::Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Self::from_env()
    }

    /// Reject configurations the service must not run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.setup_mode && self.environment.is_production() {
            return Err(ConfigError::Invalid(
                "setup_mode is enabled in a production environment; configure an admin \
                 password hash and disable setup mode"
                    .to_string(),
            ));
        }
        if self.rate_limit.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.session.duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.duration_secs must be greater than zero".to_string(),
            ));
        }
        if self.session.duration() > MAX_DURATION {
            return Err(ConfigError::Invalid(format!(
                "session.duration_secs must not exceed {}",
                MAX_DURATION.as_secs()
            )));
        }
        if self.rate_limit.lockout() > MAX_DURATION {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.lockout_secs must not exceed {}",
                MAX_DURATION.as_secs()
            )));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for admin in &self.admins {
            let email = admin.email.trim().to_lowercase();
            if email.is_empty() {
                return Err(ConfigError::Invalid("admin email must not be empty".to_string()));
            }
            if !seen.insert(email) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate admin email: {}",
                    admin.email
                )));
            }
        }

        Ok(())
    }

    /// Serialize config to TOML string (plaintext passwords are never written).
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Persist the current config to a TOML file.
    pub fn persist_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }
}

fn env_flag<F>(lookup: &F, key: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            other => Err(ConfigError::Invalid(format!("{key}: not a boolean: {other}"))),
        },
    }
}

/// Accepts humantime strings ("15m", "24h") or a bare number of seconds.
fn env_duration<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Some(Duration::from_secs(secs)));
    }
    humantime::parse_duration(raw)
        .map(Some)
        .map_err(|e| ConfigError::Invalid(format!("{key}: {e}")))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr.port(), 8787);
        assert_eq!(config.session.duration(), Duration::from_secs(86400));
        assert_eq!(config.session.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.rate_limit.max_attempts, 5);
        assert_eq!(config.rate_limit.lockout(), Duration::from_secs(900));
        assert!(!config.session.strict_ip_check);
        assert!(!config.setup_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_parse_toml() {
        let toml = r#"
            listen_addr = "127.0.0.1:8080"
            environment = "production"
            cors_allowed_origins = ["https://pmpuzzle.com"]

            [session]
            duration_secs = 7200
            strict_ip_check = true

            [rate_limit]
            max_attempts = 3

            [[admins]]
            email = "admin@pmpuzzle.com"
            display_name = "Puzzle Master"
            password_hash = "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.session.duration_secs, 7200);
        assert_eq!(config.session.sweep_interval_secs, 300);
        assert!(config.session.strict_ip_check);
        assert_eq!(config.rate_limit.max_attempts, 3);
        assert_eq!(config.rate_limit.lockout_secs, 900);
        assert_eq!(config.admins.len(), 1);
        assert_eq!(config.admins[0].display_name, "Puzzle Master");
        assert_eq!(config.cors_allowed_origins, vec!["https://pmpuzzle.com"]);
    }

    #[test]
    fn test_from_env() {
        let config = Config::from_env_with(env(&[
            ("PMP_LISTEN_ADDR", "127.0.0.1:9999"),
            ("PMP_ADMIN_EMAIL", "Admin@PMPuzzle.com"),
            ("PMP_ADMIN_NAME", "Boss"),
            ("PMP_ADMIN_PASSWORD", "hunter2"),
            ("PMP_SESSION_DURATION", "2h"),
            ("PMP_LOCKOUT_DURATION", "600"),
            ("PMP_MAX_LOGIN_ATTEMPTS", "7"),
            ("PMP_STRICT_IP_CHECK", "true"),
            ("PMP_CORS_ORIGINS", "https://a.example, https://b.example,"),
        ]))
        .unwrap();

        assert_eq!(config.listen_addr.port(), 9999);
        assert_eq!(config.admins.len(), 1);
        assert_eq!(config.admins[0].email, "Admin@PMPuzzle.com");
        assert_eq!(config.admins[0].display_name, "Boss");
        assert_eq!(config.admins[0].password.as_deref(), Some("hunter2"));
        assert_eq!(config.session.duration_secs, 7200);
        assert_eq!(config.rate_limit.lockout_secs, 600);
        assert_eq!(config.rate_limit.max_attempts, 7);
        assert!(config.session.strict_ip_check);
        assert_eq!(
            config.cors_allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn test_from_env_hash_without_email_uses_default_email() {
        let config = Config::from_env_with(env(&[(
            "PMP_ADMIN_PASSWORD_HASH",
            "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8",
        )]))
        .unwrap();
        assert_eq!(config.admins[0].email, DEFAULT_ADMIN_EMAIL);
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        assert!(Config::from_env_with(env(&[("PMP_STRICT_IP_CHECK", "sometimes")])).is_err());
        assert!(Config::from_env_with(env(&[("PMP_SESSION_DURATION", "forever")])).is_err());
        assert!(Config::from_env_with(env(&[("PMP_ENV", "staging")])).is_err());
    }

    #[test]
    fn test_setup_mode_refused_in_production() {
        let config = Config {
            setup_mode: true,
            environment: Environment::Production,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_admins_rejected() {
        let admin = |email: &str| AdminAccount {
            email: email.to_string(),
            display_name: "Admin".to_string(),
            password_hash: None,
            password: None,
        };
        let config = Config {
            admins: vec![admin("a@x.com"), admin("A@X.com")],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_never_contains_plaintext_password() {
        let config = Config {
            admins: vec![AdminAccount {
                email: "a@x.com".to_string(),
                display_name: "Admin".to_string(),
                password_hash: None,
                password: Some("super-secret".to_string()),
            }],
            ..Config::default()
        };
        let out = config.to_toml_string().unwrap();
        assert!(!out.contains("super-secret"));
        assert!(out.contains("a@x.com"));
        assert!(!format!("{config:?}").contains("super-secret"));
    }

    #[test]
    fn test_validate_caps_durations() {
        let mut config = Config::default();
        config.session.duration_secs = MAX_DURATION.as_secs();
        assert!(config.validate().is_ok());

        config.session.duration_secs = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("session.duration_secs"));

        let mut config = Config::default();
        config.rate_limit.lockout_secs = MAX_DURATION.as_secs() + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rate_limit.lockout_secs"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_clamps_instead_of_overflowing() {
        let now = Instant::now();
        assert_eq!(deadline(now, Duration::from_secs(60)), now + Duration::from_secs(60));
        assert_eq!(deadline(now, Duration::MAX), now + MAX_DURATION);
    }
}
