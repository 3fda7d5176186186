//! PM Puzzle Auth - admin session-token authentication service

use clap::Parser;
use pmpuzzle_auth::api::{self, AppState};
use pmpuzzle_auth::auth::AuthService;
use pmpuzzle_auth::config::{Config, ConfigError};
use pmpuzzle_auth::credentials::{SETUP_EMAIL, SETUP_PASSWORD};
use pmpuzzle_auth::init;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// PM Puzzle Auth - login, verify and logout for the admin dashboard
#[derive(Parser, Debug)]
#[command(name = "pmpuzzle_auth")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Run the interactive configuration wizard and exit
    #[arg(long)]
    init: bool,

    /// Read a password from stdin, print its bcrypt hash and exit
    #[arg(long)]
    hash_password: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.init {
        init::run_interactive_init("pmpuzzle_auth.toml")?;
        return Ok(());
    }
    if cli.hash_password {
        let stdin = std::io::stdin();
        init::hash_password(bcrypt::DEFAULT_COST, &mut stdin.lock(), &mut std::io::stdout())?;
        return Ok(());
    }

    // Load configuration from file if specified, otherwise use default loading
    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };

    // CLI overrides
    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }

    // Initialize tracing
    let log_level = if cli.verbose {
        "pmpuzzle_auth=trace,tower_http=trace".to_string()
    } else {
        config.log_level.clone()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;

    info!("Starting PM Puzzle Auth");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Environment: {}", config.environment);
    info!(
        "  Session duration: {}",
        humantime::format_duration(config.session.duration())
    );
    info!(
        "  Lockout: {} attempts, {}",
        config.rate_limit.max_attempts,
        humantime::format_duration(config.rate_limit.lockout())
    );
    if config.session.strict_ip_check {
        info!("  Strict IP check: enabled");
    }
    if config.trust_proxy_headers {
        warn!("  Trusting X-Forwarded-For / X-Real-IP; only enable behind a reverse proxy");
    }
    if config.cors_allowed_origins.is_empty() {
        info!("  CORS: no cross-origin callers allowed");
    } else {
        info!("  CORS origins: {}", config.cors_allowed_origins.join(", "));
    }

    let auth = Arc::new(AuthService::from_config(&config).map_err(ConfigError::from)?);
    info!("  Administrators: {}", auth.credentials().len());

    if auth.credentials().uses_setup_credential() {
        warn!("==============================================================");
        warn!("  SETUP MODE: the built-in bootstrap credential is ACTIVE");
        warn!("  Anyone can log in as {SETUP_EMAIL} / {SETUP_PASSWORD}");
        warn!("  Run `pmpuzzle_auth --init` and disable setup mode");
        warn!("==============================================================");
    }

    let maintenance = auth.spawn_maintenance(config.session.sweep_interval());

    let listen_addr = config.listen_addr;
    let state = Arc::new(AppState::new(auth, config));
    let app = api::router(state);

    // Start server with graceful shutdown
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("PM Puzzle Auth listening on http://{}", listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    maintenance.abort();
    info!("Server shutdown complete");
    Ok(())
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
