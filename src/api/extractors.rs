//! Custom Axum extractors for the auth endpoints
//!
//! These pull caller details and session tokens out of requests so handlers
//! only deal with already-normalized values.

use super::errors::ApiError;
use super::handlers::AppState;
use axum::{
    async_trait,
    body::Bytes,
    extract::{ConnectInfo, FromRef, FromRequest, FromRequestParts, Request},
    http::{header, request::Parts, HeaderMap},
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::auth::ClientInfo;

/// Caller IP and user agent.
///
/// Proxy headers (`X-Forwarded-For`, then `X-Real-IP`) are honored only when
/// `trust_proxy_headers` is enabled; otherwise the socket peer address is
/// used. Falls back to `"unknown"` when neither is available.
#[derive(Debug, Clone)]
pub struct Client(pub ClientInfo);

#[async_trait]
impl<S> FromRequestParts<S> for Client
where
    S: Send + Sync,
    Arc<AppState>: FromRef<S>,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = Arc::<AppState>::from_ref(state);

        let forwarded = if app_state.config.trust_proxy_headers {
            forwarded_ip(&parts.headers)
        } else {
            None
        };

        let ip = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(Client(ClientInfo { ip, user_agent }))
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let from_xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    let from_real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    };

    from_xff.or_else(from_real_ip).map(str::to_string)
}

/// Session token from `Authorization: Bearer <token>` or a JSON body
/// `{"token": "..."}`. The header wins when both are present.
///
/// Never rejects: a missing token is `None` so logout can stay idempotent.
#[derive(Debug, Clone, Default)]
pub struct SessionToken(pub Option<String>);

#[derive(Deserialize)]
struct TokenBody {
    token: Option<String>,
}

#[async_trait]
impl<S> FromRequest<S> for SessionToken
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(token) = bearer_token(req.headers()) {
            return Ok(SessionToken(Some(token)));
        }

        let body = Bytes::from_request(req, state).await.unwrap_or_default();
        let token = serde_json::from_slice::<TokenBody>(&body)
            .ok()
            .and_then(|b| b.token)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Ok(SessionToken(token))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// JSON body extractor that rejects with an [`ApiError`] instead of axum's
/// plain-text rejection. Missing `Content-Type` is tolerated.
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|_| ApiError::BadRequest("Failed to read request body".to_string()))?;

        serde_json::from_slice(&body)
            .map(JsonBody)
            .map_err(|_| ApiError::BadRequest("Invalid JSON body".to_string()))
    }
}
