use std::sync::Arc;

use tracing::{debug, warn};

use super::refresh::RefreshCoordinator;
use super::session::{SessionContext, SessionState};
use crate::api::{
    ApiRequest, ApiResponse, AttachedCredential, DispatchOutcome, RefreshError, RequestDispatcher,
    SessionError,
};

/// A logical request and whether it has already used its one retry.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    request: ApiRequest,
    retried: bool,
}

impl PendingRequest {
    pub fn new(request: ApiRequest) -> Self {
        Self {
            request,
            retried: false,
        }
    }

    pub fn request(&self) -> &ApiRequest {
        &self.request
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// Consume the retry. Returns false if it was already used.
    pub fn mark_retried(&mut self) -> bool {
        !std::mem::replace(&mut self.retried, true)
    }
}

/// Turns a 401 into refresh-and-retry-once, and anything past that into a
/// terminal session expiry.
pub struct SessionGuard {
    context: Arc<SessionContext>,
    dispatcher: RequestDispatcher,
    coordinator: Arc<RefreshCoordinator>,
}

impl SessionGuard {
    pub(crate) fn new(
        context: Arc<SessionContext>,
        dispatcher: RequestDispatcher,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            context,
            dispatcher,
            coordinator,
        }
    }

    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        self.refresh_if_expiring().await?;

        let mut pending = PendingRequest::new(request);
        loop {
            match self.dispatcher.send(pending.request()).await {
                DispatchOutcome::Success(response) => return Ok(response),
                DispatchOutcome::Failed(e) => return Err(e.into()),
                DispatchOutcome::AuthenticationExpired(attached) => {
                    self.recover(&mut pending, attached).await?;
                }
            }
        }
    }

    /// Renew ahead of time when the access credential is about to lapse.
    async fn refresh_if_expiring(&self) -> Result<(), SessionError> {
        let snapshot = self.context.snapshot();
        if !snapshot.needs_refresh || snapshot.state == SessionState::Expired {
            return Ok(());
        }
        debug!("Access credential close to expiry, refreshing first");
        match self.coordinator.refresh().await {
            // Whatever replaced the session decides what the request carries
            Ok(_) | Err(RefreshError::Superseded) => Ok(()),
            Err(e) => Err(SessionError::Expired { cause: Some(e) }),
        }
    }

    /// Handle a 401. Returns Ok when the request should be sent again.
    async fn recover(
        &self,
        pending: &mut PendingRequest,
        attached: AttachedCredential,
    ) -> Result<(), SessionError> {
        let Some(presented) = attached.token else {
            return Err(match self.context.state() {
                SessionState::Expired => SessionError::Expired { cause: None },
                _ => SessionError::NotAuthenticated,
            });
        };

        if pending.is_retried() {
            warn!(path = %pending.request().path, "Rejected again after refresh, ending session");
            self.context.expire(attached.epoch).await;
            return Err(SessionError::Expired { cause: None });
        }

        // Another request's refresh cycle may already have replaced the
        // credential this one went out with.
        let current = self.context.access_token();
        if current.as_deref().is_some_and(|token| token != presented) {
            debug!(path = %pending.request().path, "Credential already renewed, retrying");
        } else {
            match self.coordinator.refresh().await {
                Ok(_) => {}
                // A new login replaced the session mid-refresh; its
                // credential is good for the retry
                Err(RefreshError::Superseded) if self.context.access_token().is_some() => {
                    debug!(path = %pending.request().path, "Session replaced during refresh, retrying");
                }
                Err(e) => return Err(SessionError::Expired { cause: Some(e) }),
            }
        }

        pending.mark_retried();
        Ok(())
    }
}
