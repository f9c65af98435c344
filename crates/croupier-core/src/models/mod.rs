//! Wire types for the authentication endpoints.

pub mod auth;

pub use auth::{AuthResponse, LoginRequest, RefreshRequest, RegisterRequest, UserProfile};
