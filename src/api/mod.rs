//! HTTP API for admin authentication

mod errors;
mod extractors;
pub mod handlers;

pub use errors::{panic_response, ApiError};
pub use extractors::{Client, JsonBody, SessionToken};
pub use handlers::AppState;

use crate::metrics::{http_metrics_middleware, metrics_handler};
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Build the full router.
///
/// Routes:
///   POST /api/v1/auth/login       - exchange credentials for a token
///   POST /api/v1/auth/verify      - validate and extend a token
///   POST /api/v1/auth/logout      - drop a token (idempotent)
///   POST /api/v1/auth/logout-all  - drop every token of the caller's identity
///   POST /api/auth/{login,verify,logout} - legacy paths, same handlers
///   GET  /health, GET /metrics
pub fn router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route(
            "/login",
            post(handlers::login).fallback(handlers::method_not_allowed),
        )
        .route(
            "/verify",
            post(handlers::verify).fallback(handlers::method_not_allowed),
        )
        .route(
            "/logout",
            post(handlers::logout).fallback(handlers::method_not_allowed),
        )
        .route(
            "/logout-all",
            post(handlers::logout_all).fallback(handlers::method_not_allowed),
        );

    let legacy = Router::new()
        .route(
            "/login",
            post(handlers::legacy_login).fallback(handlers::method_not_allowed),
        )
        .route(
            "/verify",
            post(handlers::verify).fallback(handlers::method_not_allowed),
        )
        .route(
            "/logout",
            post(handlers::logout).fallback(handlers::method_not_allowed),
        );

    let cors = cors_layer(&state.config.cors_allowed_origins);

    Router::new()
        .nest("/api/v1/auth", v1)
        .nest("/api/auth", legacy)
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(metrics_handler))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            http_metrics_middleware,
        ))
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS restricted to the configured origins. Preflight requests are answered
/// by the layer itself and never reach a handler.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
