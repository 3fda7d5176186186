//! Shared test infrastructure for integration tests
//!
//! Provides an in-process app builder for `oneshot` tests and a TestServer
//! that spawns the real binary for black-box tests.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use pmpuzzle_auth::api::{self, AppState};
use pmpuzzle_auth::auth::AuthService;
use pmpuzzle_auth::config::{AdminAccount, Config};
use serde_json::Value;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

/// Port counter to avoid conflicts between tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19400);

pub const ADMIN_EMAIL: &str = "admin@pmpuzzle.com";
pub const ADMIN_PASSWORD: &str = "correct-password";
pub const ADMIN_NAME: &str = "PM Admin";

/// Cheap bcrypt cost for tests; the hash format is the same.
pub const TEST_COST: u32 = 4;

pub fn admin_hash() -> String {
    bcrypt::hash(ADMIN_PASSWORD, TEST_COST).expect("bcrypt hash")
}

/// Development config with one admin, proxy headers trusted so tests can
/// pick the caller IP with `X-Forwarded-For`.
pub fn test_config() -> Config {
    Config {
        admins: vec![AdminAccount {
            email: ADMIN_EMAIL.to_string(),
            display_name: ADMIN_NAME.to_string(),
            password_hash: Some(admin_hash()),
            password: None,
        }],
        trust_proxy_headers: true,
        bcrypt_cost: TEST_COST,
        ..Config::default()
    }
}

/// Build the full router for in-process tests.
pub fn app(config: Config) -> axum::Router {
    config.validate().expect("test config must validate");
    let auth = Arc::new(AuthService::from_config(&config).expect("auth service"));
    api::router(Arc::new(AppState::new(auth, config)))
}

pub fn post_json(uri: &str, ip: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn post_bearer(uri: &str, ip: &str, token: &str) -> Request<Body> {
    Request::post(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

/// Split a response into status, headers and parsed JSON body.
pub async fn read_json(resp: Response<Body>) -> (u16, axum::http::HeaderMap, Value) {
    let status = resp.status().as_u16();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, headers, body)
}

/// Test server wrapper that spawns a real pmpuzzle_auth binary
pub struct TestServer {
    process: Child,
    port: u16,
    _config_dir: TempDir,
}

impl TestServer {
    // ── Factory methods ──

    /// Start a server with one admin and default policies
    pub async fn start() -> Self {
        Self::spawn_with_config("").await
    }

    /// Start a server with a custom lockout threshold
    pub async fn with_max_attempts(max_attempts: u32) -> Self {
        Self::spawn_with_config(&format!(
            "[rate_limit]\nmax_attempts = {max_attempts}\nlockout_secs = 900\n"
        ))
        .await
    }

    /// Start a server that binds sessions to the login IP
    pub async fn strict_ip() -> Self {
        Self::spawn_with_config(
            "[session]\nduration_secs = 86400\nsweep_interval_secs = 300\nstrict_ip_check = true\n",
        )
        .await
    }

    // ── Shared spawn logic ──

    /// Allocate a port, write a TOML config, spawn the binary and wait for
    /// readiness. `tables` is appended after the top-level keys.
    async fn spawn_with_config(tables: &str) -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let config_dir = TempDir::new().expect("Failed to create temp dir");

        let full_config = format!(
            concat!(
                "listen_addr = \"127.0.0.1:{port}\"\n",
                "bcrypt_cost = {cost}\n",
                "{tables}\n",
                "[[admins]]\n",
                "email = \"{email}\"\n",
                "display_name = \"{name}\"\n",
                "password_hash = \"{hash}\"\n",
            ),
            port = port,
            cost = TEST_COST,
            tables = tables,
            email = ADMIN_EMAIL,
            name = ADMIN_NAME,
            hash = admin_hash(),
        );

        let config_path = config_dir.path().join("test.toml");
        std::fs::write(&config_path, &full_config).expect("Failed to write test config");

        let process = Command::new(env!("CARGO_BIN_EXE_pmpuzzle_auth"))
            .env("PMP_CONFIG", &config_path)
            .env("RUST_LOG", "pmpuzzle_auth=warn")
            .spawn()
            .expect("Failed to start server");

        let mut server = Self {
            process,
            port,
            _config_dir: config_dir,
        };
        server.wait_ready().await;
        server
    }

    // ── Instance methods ──

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..150 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                return;
            }

            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("Server exited before becoming ready: {}", status);
            }

            sleep(Duration::from_millis(100)).await;
        }

        let _ = self.process.kill();
        panic!("Timed out waiting for server on {}", addr);
    }

    /// Get the HTTP endpoint URL
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint(), path)
    }

    /// Log in as the test admin and return the token.
    pub async fn login(&self, client: &reqwest::Client) -> String {
        let resp = client
            .post(self.url("/api/v1/auth/login"))
            .json(&serde_json::json!({"email": ADMIN_EMAIL, "password": ADMIN_PASSWORD}))
            .send()
            .await
            .expect("login request failed");
        assert_eq!(resp.status().as_u16(), 200, "login should succeed");
        let body: Value = resp.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}
