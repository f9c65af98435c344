//! REST API plumbing for the gaming backend.
//!
//! This module provides:
//! - `Transport` / `HttpTransport`: raw request execution over reqwest
//! - `RequestDispatcher`: attaches the bearer credential and classifies 401
//! - `AuthApi`: login, registration, refresh and logout endpoints
//! - the error taxonomy shared by the session layer

pub mod auth;
pub mod client;
pub mod dispatcher;
pub mod error;

pub use auth::AuthApi;
pub use client::{ApiRequest, ApiResponse, HttpTransport, Transport, DEFAULT_REQUEST_TIMEOUT_SECS};
pub use dispatcher::{AttachedCredential, DispatchOutcome, RequestDispatcher};
pub use error::{ApiError, RefreshError, SessionError, StorageError, TransportError};
