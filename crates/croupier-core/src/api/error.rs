use thiserror::Error;

/// Failure to get any HTTP response at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }
}

/// Persistence failure in a credential store.
///
/// Carries rendered messages rather than the backend error so it can be
/// cloned into a shared refresh outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Keychain error: {0}")]
    Keyring(String),

    #[error("Credential file error: {0}")]
    Io(String),

    #[error("Credential encryption error: {0}")]
    Crypto(String),

    #[error("Credential store is corrupt: {0}")]
    Corrupt(String),

    #[error("Credential store is locked - set CROUPIER_STORE_PASSPHRASE")]
    Locked,
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<keyring::Error> for StorageError {
    fn from(err: keyring::Error) -> Self {
        StorageError::Keyring(err.to_string())
    }
}

/// Why a credential refresh exchange failed. Every caller awaiting the
/// same exchange receives a clone of this value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh credential available")]
    MissingCredential,

    #[error("Refresh rejected: {0}")]
    Rejected(ApiError),

    #[error("Refresh request failed: {0}")]
    Transport(TransportError),

    #[error("Refresh response invalid: {0}")]
    InvalidResponse(String),

    #[error("Failed to persist renewed credentials: {0}")]
    Storage(StorageError),

    #[error("Session changed while refresh was in flight")]
    Superseded,

    #[error("Refresh task aborted: {0}")]
    Aborted(String),
}

/// Error surfaced to callers of the session layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Non-authentication failures, returned untouched.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Terminal: the session cannot be renewed and a fresh login is required.
    #[error("Session expired - please log in again")]
    Expired {
        #[source]
        cause: Option<RefreshError>,
    },

    #[error("Not logged in")]
    NotAuthenticated,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SessionError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionError::Expired { .. })
    }
}
