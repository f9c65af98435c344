//! Session and credential lifecycle.
//!
//! This module provides:
//! - `CredentialStore`: durable storage for the access/refresh pair
//!   (OS keychain, encrypted file, or memory)
//! - `RefreshCoordinator`: single-flight exchange of the refresh credential
//! - `SessionGuard`: refresh-and-retry-once on 401, terminal expiry after that
//! - `SessionManager`: login, logout, restore and authenticated dispatch
//!
//! Only the two tokens are persisted; everything else about the session
//! lives in memory for the life of the process.

pub mod credentials;
pub mod guard;
pub mod manager;
pub mod refresh;
pub mod session;

pub use credentials::{
    CredentialPair, CredentialStore, FileCredentialStore, KeyringCredentialStore,
    MemoryCredentialStore,
};
pub use guard::{PendingRequest, SessionGuard};
pub use manager::SessionManager;
pub use refresh::{RefreshCoordinator, RefreshHandle};
pub use session::{Session, SessionData, SessionState};
