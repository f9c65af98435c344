use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use super::credentials::{CredentialPair, CredentialStore};
use crate::api::{RefreshError, StorageError};
use crate::models::UserProfile;

/// Refresh ahead of expiry once fewer than this many seconds remain
const TOKEN_REFRESH_BUFFER_SECS: i64 = 60;

/// Lifecycle of the one session in this process, as seen by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum SessionState {
    Anonymous,
    Authenticated,
    Refreshing,
    /// Terminal until the next login
    Expired,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Anonymous => "anonymous",
            SessionState::Authenticated => "authenticated",
            SessionState::Refreshing => "refreshing",
            SessionState::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionData {
    pub credentials: CredentialPair,
    pub user: Option<UserProfile>,
    /// Only known for credentials obtained in this process
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionData {
    pub fn new(credentials: CredentialPair, expires_in: Option<i64>) -> Self {
        Self {
            credentials,
            user: None,
            expires_at: expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() > at).unwrap_or(false)
    }

    /// Check if the access credential will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        self.expires_at
            .map(|at| Utc::now() > at - Duration::seconds(TOKEN_REFRESH_BUFFER_SECS))
            .unwrap_or(false)
    }

    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at.map(|at| at - Utc::now())
    }
}

/// In-memory view of the stored credentials.
///
/// `epoch` advances on every login, logout and terminal expiry, so work
/// started against an older session can tell it has been superseded.
#[derive(Debug, Default)]
pub struct Session {
    pub data: Option<SessionData>,
    pub epoch: u64,
}

impl Session {
    /// Get the bearer token if a session exists
    pub fn token(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.credentials.access_token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.credentials.refresh_token.as_str())
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.data.as_ref().and_then(|d| d.user.as_ref())
    }

    pub fn needs_refresh(&self) -> bool {
        self.data.as_ref().map(|d| d.needs_refresh()).unwrap_or(false)
    }

    fn replace(&mut self, data: Option<SessionData>) {
        self.data = data;
        self.epoch += 1;
    }
}

/// What a request needs to know about the session before sending.
#[derive(Debug, Clone)]
pub(crate) struct SessionSnapshot {
    pub token: Option<String>,
    pub epoch: u64,
    pub needs_refresh: bool,
    pub state: SessionState,
}

/// Owns the credential store, the in-memory session and the published
/// state.
///
/// Store calls block, so they run on the blocking pool under `store_op`,
/// an async lock that serializes every store mutation together with its
/// cache update. The `session` lock is only held for in-memory reads and
/// writes, never across store I/O. Every epoch change happens under
/// `store_op`, so an epoch checked after taking it stays valid until the
/// operation finishes.
pub(crate) struct SessionContext {
    store: Arc<dyn CredentialStore>,
    store_op: tokio::sync::Mutex<()>,
    session: Mutex<Session>,
    state: watch::Sender<SessionState>,
}

impl SessionContext {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let (state, _) = watch::channel(SessionState::Anonymous);
        Self {
            store,
            store_op: tokio::sync::Mutex::new(()),
            session: Mutex::new(Session::default()),
            state,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a store call on the blocking pool.
    async fn with_store<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CredentialStore) -> Result<T, StorageError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| StorageError::Io(format!("credential store task failed: {}", e)))?
    }

    fn publish(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = previous.label(), to = state.label(), "Session state changed");
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.lock();
        SessionSnapshot {
            token: session.token().map(str::to_string),
            epoch: session.epoch,
            needs_refresh: session.needs_refresh(),
            state: self.state(),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.lock().token().map(str::to_string)
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.lock().user().cloned()
    }

    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.lock().data.as_ref().and_then(|d| d.time_until_expiry())
    }

    /// Whether `epoch` still names the live session
    pub fn is_current(&self, epoch: u64) -> bool {
        self.lock().epoch == epoch
    }

    /// Populate the in-memory session from durable storage.
    pub async fn restore(&self) -> Result<SessionState, StorageError> {
        let _op = self.store_op.lock().await;
        let stored = self.with_store(|store| store.get()).await?;
        let data = match stored {
            Some(pair) if pair.is_complete() => Some(SessionData::new(pair, None)),
            Some(_) => {
                warn!("Stored credentials incomplete, discarding");
                self.with_store(|store| store.clear()).await?;
                None
            }
            None => None,
        };
        let state = if data.is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Anonymous
        };
        self.lock().replace(data);
        self.publish(state);
        Ok(state)
    }

    /// Start a fresh session from a login or registration.
    pub async fn establish(
        &self,
        pair: CredentialPair,
        user: Option<UserProfile>,
        expires_in: Option<i64>,
    ) -> Result<(), StorageError> {
        let _op = self.store_op.lock().await;
        let stored = pair.clone();
        if let Err(e) = self.with_store(move |store| store.put(&stored)).await {
            if let Err(clear_err) = self.with_store(|store| store.clear()).await {
                warn!(error = %clear_err, "Failed to clear credential store after write failure");
            }
            self.lock().replace(None);
            self.publish(SessionState::Anonymous);
            return Err(e);
        }
        let mut data = SessionData::new(pair, expires_in);
        data.user = user;
        self.lock().replace(Some(data));
        self.publish(SessionState::Authenticated);
        Ok(())
    }

    /// Drop the session and its stored credentials. Local state is cleared
    /// even if the store reports an error.
    pub async fn reset(&self) -> Result<(), StorageError> {
        let _op = self.store_op.lock().await;
        // Stop serving the old credential before the store is touched
        self.lock().replace(None);
        self.publish(SessionState::Anonymous);
        self.with_store(|store| store.clear()).await
    }

    /// Mark the start of a refresh exchange, returning the epoch it runs
    /// against and the refresh credential to present, or `None` when there
    /// is no session to refresh.
    pub fn begin_refresh(&self) -> Option<(u64, String)> {
        let session = self.lock();
        let token = session.refresh_token().map(str::to_string)?;
        self.publish(SessionState::Refreshing);
        Some((session.epoch, token))
    }

    /// Persist a renewed pair. The in-memory session only switches to the
    /// new pair once the store write succeeded.
    pub async fn commit_refresh(
        &self,
        epoch: u64,
        pair: CredentialPair,
        expires_in: Option<i64>,
    ) -> Result<(), RefreshError> {
        let _op = self.store_op.lock().await;
        if !self.is_current(epoch) {
            return Err(RefreshError::Superseded);
        }
        let stored = pair.clone();
        if let Err(e) = self.with_store(move |store| store.put(&stored)).await {
            self.expire_held().await;
            return Err(RefreshError::Storage(e));
        }
        let mut session = self.lock();
        let user = session.data.take().and_then(|d| d.user);
        let mut data = SessionData::new(pair, expires_in);
        data.user = user;
        session.data = Some(data);
        drop(session);
        self.publish(SessionState::Authenticated);
        Ok(())
    }

    /// Terminate the session identified by `epoch`: clear the store, drop
    /// the in-memory pair and publish `Expired`. A no-op if the session has
    /// already been replaced.
    pub async fn expire(&self, epoch: u64) {
        let _op = self.store_op.lock().await;
        if self.is_current(epoch) {
            self.expire_held().await;
        }
    }

    /// Caller holds `store_op`.
    async fn expire_held(&self) {
        self.lock().replace(None);
        self.publish(SessionState::Expired);
        if let Err(e) = self.with_store(|store| store.clear()).await {
            warn!(error = %e, "Failed to clear credential store on expiry");
        }
    }

    #[cfg(test)]
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }
}
