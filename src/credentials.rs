//! Administrator credential store.
//!
//! Identities are built once from [`Config`] and never mutated afterwards.
//! The password representation is decided at load time as a [`PasswordHash`]
//! variant, so requests never sniff hash prefixes.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use subtle::ConstantTimeEq;
use tracing::{error, warn};
use zeroize::Zeroizing;

use crate::config::Config;

/// Identity created in setup mode when no administrator is configured.
pub const SETUP_EMAIL: &str = "admin@localhost";

/// Bootstrap password accepted only while setup mode is enabled.
/// INSECURE: anyone reading this source knows it.
pub const SETUP_PASSWORD: &str = "pmpuzzle-setup";

const BCRYPT_PREFIXES: [&str; 4] = ["$2a$", "$2b$", "$2x$", "$2y$"];
const BCRYPT_HASH_LEN: usize = 60;

/// Credential errors. None of these mean "wrong password".
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("malformed password hash for {email}: {reason}")]
    MalformedHash { email: String, reason: String },

    #[error(
        "no password configured for {0}; set PMP_ADMIN_PASSWORD_HASH (or PMP_ADMIN_PASSWORD) \
         or enable setup mode for first-run bootstrap"
    )]
    NotConfigured(String),

    #[error("bcrypt error: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),
}

/// Stored password representation.
#[derive(Clone)]
pub enum PasswordHash {
    /// `$2b$...` bcrypt hash, verified with bcrypt's constant-time comparison.
    Bcrypt(String),
    /// Legacy unsalted SHA-256 digest.
    LegacyDigest([u8; 32]),
    /// Setup-mode bootstrap credential.
    Plaintext(Zeroizing<String>),
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PasswordHash::{}(<redacted>)", self.format())
    }
}

impl PasswordHash {
    /// Classify a configured hash string.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if BCRYPT_PREFIXES.iter().any(|p| raw.starts_with(p)) {
            if raw.len() != BCRYPT_HASH_LEN {
                return Err(format!(
                    "bcrypt hash must be {BCRYPT_HASH_LEN} characters, got {}",
                    raw.len()
                ));
            }
            return Ok(PasswordHash::Bcrypt(raw.to_string()));
        }

        if raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            let mut digest = [0u8; 32];
            hex::decode_to_slice(raw, &mut digest).map_err(|e| e.to_string())?;
            return Ok(PasswordHash::LegacyDigest(digest));
        }

        Err("expected a bcrypt hash ($2b$...) or a 64-character hex SHA-256 digest".to_string())
    }

    /// Hash a plaintext password with bcrypt.
    pub fn bcrypt(password: &str, cost: u32) -> Result<Self, CredentialError> {
        Ok(PasswordHash::Bcrypt(bcrypt::hash(password, cost)?))
    }

    /// Legacy digest of a plaintext password.
    pub fn legacy_digest(password: &str) -> Self {
        PasswordHash::LegacyDigest(Sha256::digest(password.as_bytes()).into())
    }

    pub fn format(&self) -> &'static str {
        match self {
            PasswordHash::Bcrypt(_) => "bcrypt",
            PasswordHash::LegacyDigest(_) => "legacy-digest",
            PasswordHash::Plaintext(_) => "plaintext",
        }
    }

    /// Compare a supplied password. `Ok(false)` on mismatch; errors only for
    /// a hash bcrypt cannot read.
    pub fn verify(&self, supplied: &str) -> Result<bool, CredentialError> {
        match self {
            PasswordHash::Bcrypt(hash) => Ok(bcrypt::verify(supplied, hash)?),
            PasswordHash::LegacyDigest(expected) => {
                let actual: [u8; 32] = Sha256::digest(supplied.as_bytes()).into();
                Ok(actual[..].ct_eq(&expected[..]).into())
            }
            PasswordHash::Plaintext(expected) => {
                Ok(supplied.as_bytes().ct_eq(expected.as_bytes()).into())
            }
        }
    }
}

/// An administrator who may log in to the dashboard.
#[derive(Debug, Clone)]
pub struct AdminIdentity {
    /// Lower-cased email, the lookup key
    pub email: String,
    pub display_name: String,
    /// `None` when neither a password nor setup mode is available
    pub password: Option<PasswordHash>,
}

impl AdminIdentity {
    pub fn new(email: &str, display_name: &str, password: Option<PasswordHash>) -> Self {
        Self {
            email: normalize_email(email),
            display_name: display_name.to_string(),
            password,
        }
    }

    /// Check a supplied password against this identity.
    pub fn verify_password(&self, supplied: &str) -> Result<bool, CredentialError> {
        let Some(hash) = &self.password else {
            return Err(CredentialError::NotConfigured(self.email.clone()));
        };
        if let PasswordHash::Plaintext(_) = hash {
            warn!(
                email = %self.email,
                "!!! INSECURE SETUP-MODE CREDENTIAL IN USE !!! Configure PMP_ADMIN_PASSWORD_HASH \
                 and disable setup mode before exposing this service"
            );
        }
        hash.verify(supplied)
    }
}

/// Immutable map of administrator identities keyed by lower-cased email.
#[derive(Debug, Default)]
pub struct CredentialStore {
    identities: HashMap<String, AdminIdentity>,
}

impl CredentialStore {
    pub fn new(identities: impl IntoIterator<Item = AdminIdentity>) -> Self {
        Self {
            identities: identities
                .into_iter()
                .map(|identity| (identity.email.clone(), identity))
                .collect(),
        }
    }

    /// Build the store from configuration, hashing plaintext passwords and
    /// classifying configured hashes once.
    pub fn from_config(config: &Config) -> Result<Self, CredentialError> {
        let mut identities = Vec::with_capacity(config.admins.len().max(1));

        for account in &config.admins {
            let password = match (&account.password_hash, &account.password) {
                (Some(raw), _) => Some(PasswordHash::parse(raw).map_err(|reason| {
                    CredentialError::MalformedHash {
                        email: account.email.clone(),
                        reason,
                    }
                })?),
                (None, Some(plain)) => Some(PasswordHash::bcrypt(plain, config.bcrypt_cost)?),
                (None, None) if config.setup_mode => Some(setup_credential()),
                (None, None) => {
                    error!(
                        email = %account.email,
                        "admin has no password configured and setup mode is off; \
                         logins for this account will fail with a configuration error"
                    );
                    None
                }
            };

            if let Some(PasswordHash::LegacyDigest(_)) = password {
                warn!(
                    email = %account.email,
                    "admin password uses a legacy unsalted digest; re-hash with --hash-password"
                );
            }

            identities.push(AdminIdentity::new(
                &account.email,
                &account.display_name,
                password,
            ));
        }

        if identities.is_empty() {
            if config.setup_mode {
                identities.push(AdminIdentity::new(
                    SETUP_EMAIL,
                    "Setup Admin",
                    Some(setup_credential()),
                ));
            } else {
                error!("no administrator accounts configured; every login will be refused");
            }
        }

        Ok(Self::new(identities))
    }

    /// Case-insensitive lookup.
    pub fn find_by_email(&self, email: &str) -> Option<&AdminIdentity> {
        self.identities.get(&normalize_email(email))
    }

    pub fn verify_password(
        &self,
        identity: &AdminIdentity,
        supplied: &str,
    ) -> Result<bool, CredentialError> {
        identity.verify_password(supplied)
    }

    /// True when at least one identity exists.
    pub fn is_configured(&self) -> bool {
        !self.identities.is_empty()
    }

    /// True when any identity relies on the setup-mode bootstrap credential.
    pub fn uses_setup_credential(&self) -> bool {
        self.identities
            .values()
            .any(|i| matches!(i.password, Some(PasswordHash::Plaintext(_))))
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

fn setup_credential() -> PasswordHash {
    PasswordHash::Plaintext(Zeroizing::new(SETUP_PASSWORD.to_string()))
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
