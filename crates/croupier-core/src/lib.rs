//! Client-side session management for the casino backend.
//!
//! Attaches bearer credentials to outgoing requests, renews them with a
//! single coordinated refresh when they expire, persists the renewed pair,
//! and ends the session deterministically when renewal fails.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, ApiRequest, ApiResponse, SessionError};
pub use auth::{CredentialPair, SessionManager, SessionState};
pub use config::{Config, CredentialBackend};
