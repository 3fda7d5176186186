//! Interactive configuration wizard for `--init` flag, plus the
//! `--hash-password` helper.
//!
//! Walks the operator through creating a `pmpuzzle_auth.toml` file. The admin
//! password is bcrypt-hashed before anything is shown or written.

use crate::config::{
    AdminAccount, Config, ConfigError, Environment, RateLimitConfig, SessionConfig,
    DEFAULT_ADMIN_EMAIL,
};
use crate::credentials::CredentialError;
use std::io::{self, BufRead, Write};
use zeroize::Zeroizing;

const MIN_PASSWORD_LEN: usize = 8;

/// Errors that can occur during interactive init.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Hashing failed: {0}")]
    Hash(#[from] CredentialError),

    #[error("Cancelled by user")]
    Cancelled,
}

/// Public entry point wiring stdin/stdout.
pub fn run_interactive_init(default_output_path: &str) -> Result<(), InitError> {
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let mut writer = io::stdout();
    run_init_inner(
        default_output_path,
        bcrypt::DEFAULT_COST,
        &mut reader,
        &mut writer,
    )
}

/// Read one password line and write its bcrypt hash.
pub fn hash_password(
    cost: u32,
    reader: &mut impl BufRead,
    writer: &mut impl Write,
) -> Result<(), InitError> {
    let mut line = Zeroizing::new(String::new());
    if reader.read_line(&mut line)? == 0 {
        return Err(InitError::Cancelled);
    }
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        return Err(InitError::Cancelled);
    }
    let hash = bcrypt::hash(password, cost).map_err(CredentialError::from)?;
    writeln!(writer, "{hash}")?;
    Ok(())
}

/// Prompt the user for a string value, returning `default` on empty input.
/// Returns `Err(InitError::Cancelled)` on EOF.
fn prompt(
    reader: &mut impl BufRead,
    writer: &mut impl Write,
    label: &str,
    default: &str,
) -> Result<String, InitError> {
    write!(writer, "{} [{}]: ", label, default)?;
    writer.flush()?;
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(InitError::Cancelled);
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

/// Prompt for a yes/no answer. Retries on invalid input.
fn prompt_yes_no(
    reader: &mut impl BufRead,
    writer: &mut impl Write,
    label: &str,
    default: bool,
) -> Result<bool, InitError> {
    let default_str = if default { "y" } else { "n" };
    loop {
        let answer = prompt(reader, writer, label, default_str)?;
        match answer.to_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => {
                writeln!(writer, "  Please answer y or n.")?;
            }
        }
    }
}

/// Prompt for a value that must parse to `T`. Retries on parse failure.
fn prompt_parse<T>(
    reader: &mut impl BufRead,
    writer: &mut impl Write,
    label: &str,
    default: T,
) -> Result<T, InitError>
where
    T: std::str::FromStr + std::fmt::Display,
{
    let default_str = default.to_string();
    loop {
        let answer = prompt(reader, writer, label, &default_str)?;
        match answer.parse::<T>() {
            Ok(val) => return Ok(val),
            Err(_) => {
                writeln!(writer, "  Invalid value, please try again.")?;
            }
        }
    }
}

/// Prompt until a password of acceptable length is entered.
fn prompt_password(
    reader: &mut impl BufRead,
    writer: &mut impl Write,
) -> Result<Zeroizing<String>, InitError> {
    loop {
        write!(writer, "Admin password: ")?;
        writer.flush()?;
        let mut line = Zeroizing::new(String::new());
        if reader.read_line(&mut line)? == 0 {
            return Err(InitError::Cancelled);
        }
        let password = line.trim_end_matches(['\r', '\n']);
        if password.chars().count() >= MIN_PASSWORD_LEN {
            return Ok(Zeroizing::new(password.to_string()));
        }
        writeln!(
            writer,
            "  Password must be at least {MIN_PASSWORD_LEN} characters."
        )?;
    }
}

/// Core wizard logic, testable with any `BufRead`/`Write`.
pub fn run_init_inner(
    default_output_path: &str,
    bcrypt_cost: u32,
    reader: &mut impl BufRead,
    writer: &mut impl Write,
) -> Result<(), InitError> {
    writeln!(writer)?;
    writeln!(writer, "PM Puzzle Auth - Interactive Configuration")?;
    writeln!(writer, "==========================================")?;
    writeln!(writer)?;

    // --- Output file ---
    let output_path = prompt(reader, writer, "Output config file", default_output_path)?;
    writeln!(writer)?;

    if std::path::Path::new(&output_path).exists() {
        let overwrite = prompt_yes_no(
            reader,
            writer,
            &format!("{output_path} already exists. Overwrite?"),
            false,
        )?;
        if !overwrite {
            writeln!(writer, "Cancelled.")?;
            return Ok(());
        }
        writeln!(writer)?;
    }

    let defaults = Config::default();

    // --- Server ---
    writeln!(writer, "--- Server ---")?;
    let listen_addr: std::net::SocketAddr =
        prompt_parse(reader, writer, "Listen address", defaults.listen_addr)?;
    let environment: Environment = prompt_parse(
        reader,
        writer,
        "Environment (development / production)",
        defaults.environment,
    )?;
    let log_level = prompt(reader, writer, "Log level", &defaults.log_level)?;

    writeln!(writer)?;

    // --- Administrator ---
    writeln!(writer, "--- Administrator ---")?;
    let email = loop {
        let email = prompt(reader, writer, "Admin email", DEFAULT_ADMIN_EMAIL)?;
        if email.contains('@') {
            break email;
        }
        writeln!(writer, "  Please enter an email address.")?;
    };
    let display_name = prompt(reader, writer, "Display name", "Admin")?;
    let password = prompt_password(reader, writer)?;
    writeln!(writer, "  Hashing password...")?;
    let password_hash =
        bcrypt::hash(password.as_str(), bcrypt_cost).map_err(CredentialError::from)?;

    writeln!(writer)?;

    // --- Sessions & Lockout ---
    writeln!(writer, "--- Sessions & Lockout ---")?;
    let session_duration: humantime::Duration = prompt_parse(
        reader,
        writer,
        "Session duration",
        defaults.session.duration().into(),
    )?;
    let strict_ip_check = prompt_yes_no(
        reader,
        writer,
        "Bind sessions to the login IP? (breaks roaming clients)",
        false,
    )?;
    let max_attempts: u32 = loop {
        let v: u32 = prompt_parse(
            reader,
            writer,
            "Failed logins before lockout",
            defaults.rate_limit.max_attempts,
        )?;
        if v > 0 {
            break v;
        }
        writeln!(writer, "  Value must be at least 1.")?;
    };
    let lockout: humantime::Duration = prompt_parse(
        reader,
        writer,
        "Lockout duration",
        defaults.rate_limit.lockout().into(),
    )?;
    let origins = prompt(
        reader,
        writer,
        "Allowed CORS origins (comma separated, empty for none)",
        "",
    )?;
    let cors_allowed_origins = origins
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();

    let config = Config {
        listen_addr,
        environment,
        admins: vec![AdminAccount {
            email,
            display_name,
            password_hash: Some(password_hash),
            password: None,
        }],
        session: SessionConfig {
            duration_secs: session_duration.as_secs(),
            strict_ip_check,
            ..defaults.session.clone()
        },
        rate_limit: RateLimitConfig {
            max_attempts,
            lockout_secs: lockout.as_secs(),
        },
        cors_allowed_origins,
        log_level,
        ..defaults
    };
    config.validate()?;

    // Show summary
    writeln!(writer)?;
    writeln!(writer, "--- Generated Configuration ---")?;
    let toml_str = config.to_toml_string()?;
    writeln!(writer, "{toml_str}")?;

    let do_write = prompt_yes_no(reader, writer, &format!("Write to {output_path}?"), true)?;

    if do_write {
        config.persist_to_file(&output_path)?;
        writeln!(writer, "Configuration written to {output_path}")?;
    } else {
        writeln!(writer, "Cancelled. No file written.")?;
    }

    Ok(())
}
