//! Prometheus metrics for the auth service.
//!
//! All metric types use atomics internally (no locks on the hot path).
//! The `Metrics` struct is `Clone`-cheap (Arc-based registry + Arc-based collectors).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder, TEXT_FORMAT,
};
use std::sync::Arc;
use std::time::Instant;

use crate::api::AppState;
use crate::auth::AuthError;

/// All Prometheus metrics for the auth service.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // -- Process & Build --
    pub process_start_time_seconds: Gauge,
    pub build_info: GaugeVec,

    // -- HTTP Requests --
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,

    // -- Auth --
    pub auth_attempts_total: IntCounterVec,
    pub auth_failures_total: IntCounterVec,
    pub lockouts_total: IntCounter,

    // -- Stores (updated on scrape) --
    pub active_sessions: Gauge,
    pub tracked_lockout_keys: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // -- Process & Build --
        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry
            .register(Box::new(process_start_time_seconds.clone()))
            .unwrap();
        process_start_time_seconds.set(chrono::Utc::now().timestamp() as f64);

        let build_info = GaugeVec::new(
            Opts::new("pmpuzzle_build_info", "Build information"),
            &["version"],
        )
        .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1.0);

        // -- HTTP Requests --
        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "pmpuzzle_http_requests_total",
                "Total HTTP requests by method, status, and operation",
            ),
            &["method", "status", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_requests_total.clone()))
            .unwrap();

        // Login latency is dominated by bcrypt, so buckets reach into seconds
        let duration_buckets = vec![
            0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
        ];
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pmpuzzle_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(duration_buckets),
            &["method", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .unwrap();

        // -- Auth --
        let auth_attempts_total = IntCounterVec::new(
            Opts::new("pmpuzzle_auth_attempts_total", "Login attempts by result"),
            &["result"],
        )
        .unwrap();
        registry
            .register(Box::new(auth_attempts_total.clone()))
            .unwrap();

        let auth_failures_total = IntCounterVec::new(
            Opts::new("pmpuzzle_auth_failures_total", "Auth failures by reason"),
            &["reason"],
        )
        .unwrap();
        registry
            .register(Box::new(auth_failures_total.clone()))
            .unwrap();

        let lockouts_total = IntCounter::new(
            "pmpuzzle_lockouts_total",
            "Rate-limit keys locked after too many failed logins",
        )
        .unwrap();
        registry.register(Box::new(lockouts_total.clone())).unwrap();

        // -- Stores --
        let active_sessions = Gauge::new(
            "pmpuzzle_active_sessions",
            "Sessions currently held in memory (updated on scrape)",
        )
        .unwrap();
        registry
            .register(Box::new(active_sessions.clone()))
            .unwrap();

        let tracked_lockout_keys = Gauge::new(
            "pmpuzzle_lockout_keys",
            "Rate-limit keys with recorded failures (updated on scrape)",
        )
        .unwrap();
        registry
            .register(Box::new(tracked_lockout_keys.clone()))
            .unwrap();

        Metrics {
            registry,
            process_start_time_seconds,
            build_info,
            http_requests_total,
            http_request_duration_seconds,
            auth_attempts_total,
            auth_failures_total,
            lockouts_total,
            active_sessions,
            tracked_lockout_keys,
        }
    }

    pub fn record_login_success(&self) {
        self.auth_attempts_total
            .with_label_values(&["success"])
            .inc();
    }

    /// Count a failed auth operation. Only login failures count as attempts.
    pub fn record_auth_failure(&self, err: &AuthError, is_login: bool) {
        if is_login {
            self.auth_attempts_total
                .with_label_values(&["failure"])
                .inc();
        }
        self.auth_failures_total
            .with_label_values(&[err.reason()])
            .inc();
        if let AuthError::InvalidCredentials {
            locked_now: true, ..
        } = err
        {
            self.lockouts_total.inc();
        }
    }
}

/// Classify a request into a bounded operation label.
pub fn classify_operation(method: &str, path: &str) -> &'static str {
    if method == "OPTIONS" {
        return "preflight";
    }

    match path {
        "/health" => "health",
        "/metrics" => "metrics",
        "/api/v1/auth/login" => "login",
        "/api/v1/auth/verify" => "verify",
        "/api/v1/auth/logout" => "logout",
        "/api/v1/auth/logout-all" => "logout_all",
        "/api/auth/login" => "legacy_login",
        "/api/auth/verify" => "legacy_verify",
        "/api/auth/logout" => "legacy_logout",
        _ => "unknown",
    }
}

/// Axum middleware that records HTTP request metrics.
pub async fn http_metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => return next.run(request).await,
    };

    let method = request.method().to_string();
    let operation = classify_operation(&method, request.uri().path());

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();

    metrics
        .http_requests_total
        .with_label_values(&[&method, &status, operation])
        .inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(&[&method, operation])
        .observe(duration);

    response
}

/// Handler for GET /metrics, returns Prometheus text format.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => {
            return (StatusCode::NOT_FOUND, "Metrics not enabled").into_response();
        }
    };

    metrics
        .active_sessions
        .set(state.auth.sessions().len() as f64);
    metrics
        .tracked_lockout_keys
        .set(state.auth.lockouts().len() as f64);

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (StatusCode::OK, [("content-type", TEXT_FORMAT)], buffer).into_response()
}
