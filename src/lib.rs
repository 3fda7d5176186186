//! PM Puzzle admin authentication service
//!
//! Token-based login/verify/logout for the admin dashboard, with in-memory
//! sessions, failed-login lockout and optional IP binding.

pub mod api;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod init;
pub mod lockout;
pub mod metrics;
pub mod session;
