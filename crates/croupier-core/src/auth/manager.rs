//! The one session of this process and its entry points.
//!
//! `SessionManager` owns the credential store, the refresh coordinator and
//! the published `SessionState`, and hands out authenticated dispatch.
//! Nothing here is global: build one per process (or per test) and share it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use super::credentials::{CredentialPair, CredentialStore};
use super::guard::SessionGuard;
use super::refresh::RefreshCoordinator;
use super::session::{SessionContext, SessionState};
use crate::api::{
    ApiError, ApiRequest, ApiResponse, AuthApi, HttpTransport, RequestDispatcher, SessionError,
    Transport,
};
use crate::config::Config;
use crate::models::{AuthResponse, UserProfile};

pub struct SessionManager {
    context: Arc<SessionContext>,
    auth: AuthApi,
    coordinator: Arc<RefreshCoordinator>,
    guard: SessionGuard,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn CredentialStore>) -> Self {
        let context = Arc::new(SessionContext::new(store));
        let auth = AuthApi::new(transport.clone());
        let coordinator = RefreshCoordinator::new(context.clone(), auth.clone());
        let dispatcher = RequestDispatcher::new(transport, context.clone());
        let guard = SessionGuard::new(context.clone(), dispatcher, coordinator.clone());
        Self {
            context,
            auth,
            coordinator,
            guard,
        }
    }

    /// Build a manager talking to the configured backend over HTTP.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new(
            config.api_base_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
        .context("Failed to build HTTP client")?;
        let store = config.credential_store()?;
        Ok(Self::new(Arc::new(transport), store))
    }

    /// Pick up credentials persisted by an earlier run.
    pub async fn restore(&self) -> Result<SessionState, SessionError> {
        let state = self.context.restore().await?;
        info!(state = state.label(), "Session restored");
        Ok(state)
    }

    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        two_factor_code: Option<&str>,
    ) -> Result<Option<UserProfile>, SessionError> {
        let auth = self.auth.login(identifier, password, two_factor_code).await?;
        self.establish(auth).await
    }

    pub async fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
    ) -> Result<Option<UserProfile>, SessionError> {
        let auth = self.auth.register(email, username, password).await?;
        self.establish(auth).await
    }

    async fn establish(&self, auth: AuthResponse) -> Result<Option<UserProfile>, SessionError> {
        let user = auth.user.clone();
        let pair = CredentialPair::new(auth.access_token, auth.refresh_token);
        self.context
            .establish(pair, auth.user, auth.expires_in)
            .await?;
        Ok(user)
    }

    /// End the session. The backend call is best-effort; local credentials
    /// are cleared regardless of its outcome.
    pub async fn logout(&self) -> Result<(), SessionError> {
        if let Some(token) = self.context.access_token() {
            if let Err(e) = self.auth.logout(&token).await {
                warn!(error = %e, "Logout request failed, clearing local session anyway");
            }
        }
        self.context.reset().await?;
        info!("Logged out");
        Ok(())
    }

    /// Send a request with the session's credential, refreshing and
    /// retrying once if the credential has expired.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        self.guard.execute(request).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SessionError> {
        let response = self.send(ApiRequest::get(path)).await?;
        Self::decode(response)
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, SessionError> {
        let request = ApiRequest::json(reqwest::Method::POST, path, body)?;
        let response = self.send(request).await?;
        Self::decode(response)
    }

    fn decode<T: DeserializeOwned>(response: ApiResponse) -> Result<T, SessionError> {
        if response.body.trim().is_empty() {
            return Err(ApiError::InvalidResponse("Empty response body".to_string()).into());
        }
        Ok(response.json()?)
    }

    pub fn state(&self) -> SessionState {
        self.context.state()
    }

    /// Receive every state change, for the UI layer.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.context.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Authenticated | SessionState::Refreshing
        )
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.context.user()
    }

    pub fn time_until_expiry(&self) -> Option<ChronoDuration> {
        self.context.time_until_expiry()
    }

    pub fn is_refreshing(&self) -> bool {
        self.coordinator.is_refreshing()
    }
}
