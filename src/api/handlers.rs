//! Auth API request handlers

use super::errors::ApiError;
use super::extractors::{Client, JsonBody, SessionToken};
use crate::auth::{AuthError, AuthService, UserView};
use crate::config::Config;
use crate::metrics::Metrics;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Application state shared across handlers
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub config: Config,
    pub metrics: Option<Metrics>,
}

impl AppState {
    pub fn new(auth: Arc<AuthService>, config: Config) -> Self {
        let metrics = config.metrics_enabled.then(Metrics::new);
        Self {
            auth,
            config,
            metrics,
        }
    }

    /// Convert a service error, recording it first.
    fn reject(&self, err: AuthError, is_login: bool) -> ApiError {
        if let Some(metrics) = &self.metrics {
            metrics.record_auth_failure(&err, is_login);
        }
        ApiError::from_auth(err, !self.config.environment.is_production())
    }
}

#[derive(Deserialize)]
pub struct LoginRequest {
    email: Option<String>,
    password: Option<String>,
}

/// Older dashboard builds post `username` instead of `email`.
#[derive(Deserialize)]
pub struct LegacyLoginRequest {
    username: Option<String>,
    email: Option<String>,
    password: Option<String>,
}

impl From<LegacyLoginRequest> for LoginRequest {
    fn from(legacy: LegacyLoginRequest) -> Self {
        LoginRequest {
            email: legacy.email.or(legacy.username),
            password: legacy.password,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    success: bool,
    token: String,
    user: UserView,
    expires_in: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    success: bool,
    user: UserView,
    expires_in: u64,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
pub struct LogoutAllResponse {
    success: bool,
    invalidated: usize,
}

/// Health check response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    build_time: &'static str,
    sessions: usize,
}

/// POST /api/v1/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Client(client): Client,
    JsonBody(body): JsonBody<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let email = body.email.unwrap_or_default();
    let password = Zeroizing::new(body.password.unwrap_or_default());

    let success = state
        .auth
        .login(&email, password, &client)
        .await
        .map_err(|e| state.reject(e, true))?;

    if let Some(metrics) = &state.metrics {
        metrics.record_login_success();
    }

    Ok(Json(LoginResponse {
        success: true,
        token: success.token,
        user: success.user,
        expires_in: seconds(success.expires_in),
    }))
}

/// POST /api/auth/login, translated to the canonical login.
pub async fn legacy_login(
    state: State<Arc<AppState>>,
    client: Client,
    JsonBody(body): JsonBody<LegacyLoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    login(state, client, JsonBody(body.into())).await
}

/// POST /api/v1/auth/verify
pub async fn verify(
    State(state): State<Arc<AppState>>,
    Client(client): Client,
    SessionToken(token): SessionToken,
) -> Result<Json<VerifyResponse>, ApiError> {
    let token = token.ok_or_else(|| state.reject(AuthError::MissingToken, false))?;

    let verified = state
        .auth
        .verify(&token, &client.ip)
        .map_err(|e| state.reject(e, false))?;

    Ok(Json(VerifyResponse {
        success: true,
        user: verified.user,
        expires_in: seconds(verified.expires_in),
    }))
}

/// POST /api/v1/auth/logout, always succeeds.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    SessionToken(token): SessionToken,
) -> Json<LogoutResponse> {
    state.auth.logout(token.as_deref());
    Json(LogoutResponse { success: true })
}

/// POST /api/v1/auth/logout-all
pub async fn logout_all(
    State(state): State<Arc<AppState>>,
    Client(client): Client,
    SessionToken(token): SessionToken,
) -> Result<Json<LogoutAllResponse>, ApiError> {
    let token = token.ok_or_else(|| state.reject(AuthError::MissingToken, false))?;

    let invalidated = state
        .auth
        .logout_everywhere(&token, &client.ip)
        .map_err(|e| state.reject(e, false))?;

    Ok(Json(LogoutAllResponse {
        success: true,
        invalidated,
    }))
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        build_time: env!("PMP_BUILD_TIME"),
        sessions: state.auth.sessions().len(),
    })
}

/// Fallback for routes that exist but were called with the wrong method.
pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

/// Whole seconds, rounded up so a fresh session never reports less than it has.
fn seconds(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
