//! Single-flight credential refresh.
//!
//! At most one exchange with the refresh endpoint runs at a time. Callers
//! that ask for a refresh while one is outstanding await the same
//! `RefreshHandle` and receive the same outcome. The backend revokes a
//! refresh credential once it has been used, so a second concurrent
//! exchange would fail and end a perfectly good session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::credentials::CredentialPair;
use super::session::SessionContext;
use crate::api::{AuthApi, RefreshError};

/// A refresh exchange that any number of callers may await.
pub type RefreshHandle = Shared<BoxFuture<'static, Result<CredentialPair, RefreshError>>>;

struct InFlight {
    id: u64,
    handle: RefreshHandle,
}

pub struct RefreshCoordinator {
    context: Arc<SessionContext>,
    auth: AuthApi,
    inflight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

impl RefreshCoordinator {
    pub(crate) fn new(context: Arc<SessionContext>, auth: AuthApi) -> Arc<Self> {
        Arc::new(Self {
            context,
            auth,
            inflight: Mutex::new(None),
            next_id: AtomicU64::new(0),
        })
    }

    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether an exchange is currently outstanding
    pub fn is_refreshing(&self) -> bool {
        self.slot().is_some()
    }

    /// Renew the credential pair, joining the outstanding exchange if
    /// there is one.
    ///
    /// The exchange runs on its own task: dropping this future does not
    /// cancel it, and other waiters still see it settle.
    pub async fn refresh(self: &Arc<Self>) -> Result<CredentialPair, RefreshError> {
        let handle = {
            let mut slot = self.slot();
            match slot.as_ref() {
                Some(inflight) => {
                    debug!(refresh_id = inflight.id, "Joining in-flight refresh");
                    inflight.handle.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                    let handle = self.start(id);
                    *slot = Some(InFlight {
                        id,
                        handle: handle.clone(),
                    });
                    handle
                }
            }
        };
        handle.await
    }

    fn start(self: &Arc<Self>, id: u64) -> RefreshHandle {
        debug!(refresh_id = id, "Starting refresh exchange");
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = this.exchange(id).await;
            this.settle(id);
            result
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    // Task died before settling; free the slot so the next
                    // expiry can start over.
                    if let Some(this) = weak.upgrade() {
                        this.settle(id);
                    }
                    Err(RefreshError::Aborted(e.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Drop the handle for exchange `id` once it has settled.
    fn settle(&self, id: u64) {
        let mut slot = self.slot();
        if slot.as_ref().map(|inflight| inflight.id) == Some(id) {
            *slot = None;
        }
    }

    async fn exchange(&self, id: u64) -> Result<CredentialPair, RefreshError> {
        let Some((epoch, refresh_token)) = self.context.begin_refresh() else {
            debug!(refresh_id = id, "No refresh credential, nothing to exchange");
            return Err(RefreshError::MissingCredential);
        };

        let result = match self.auth.refresh(&refresh_token).await {
            Ok(auth) => {
                let pair = CredentialPair::new(auth.access_token, auth.refresh_token);
                self.context
                    .commit_refresh(epoch, pair.clone(), auth.expires_in)
                    .await
                    .map(|()| pair)
            }
            // A login or logout in the meantime may have revoked the
            // credential this exchange presented
            Err(_) if !self.context.is_current(epoch) => Err(RefreshError::Superseded),
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => info!(refresh_id = id, "Credentials refreshed"),
            Err(RefreshError::Superseded) => {
                debug!(refresh_id = id, "Session replaced during refresh, result discarded");
            }
            Err(e) => {
                warn!(refresh_id = id, error = %e, "Refresh failed, ending session");
                self.context.expire(epoch).await;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::api::{ApiError, StorageError};
    use crate::auth::{CredentialStore, MemoryCredentialStore, SessionState};
    use crate::testing::{FailingStore, RefreshScript, ScriptedTransport};

    async fn coordinator(
        transport: Arc<ScriptedTransport>,
        store: Arc<dyn CredentialStore>,
    ) -> (Arc<RefreshCoordinator>, Arc<SessionContext>) {
        let context = Arc::new(SessionContext::new(store));
        context
            .establish(CredentialPair::new("A1", "R1"), None, None)
            .await
            .unwrap();
        transport.accept_refresh("R1");
        let coordinator = RefreshCoordinator::new(context.clone(), AuthApi::new(transport));
        (coordinator, context)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_exchange() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_refresh_delay(Duration::from_millis(20));
        transport.script_refresh(RefreshScript::Issue(CredentialPair::new("A2", "R2")));
        let store = Arc::new(MemoryCredentialStore::new());
        let (coordinator, _) = coordinator(transport.clone(), store.clone()).await;

        let results = futures::future::join_all((0..5).map(|_| coordinator.refresh())).await;

        assert_eq!(transport.refresh_calls(), 1);
        for result in results {
            assert_eq!(result.unwrap(), CredentialPair::new("A2", "R2"));
        }
        assert_eq!(store.get().unwrap(), Some(CredentialPair::new("A2", "R2")));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_late_joiner_shares_outstanding_exchange() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_refresh_delay(Duration::from_millis(50));
        transport.script_refresh(RefreshScript::Issue(CredentialPair::new("A2", "R2")));
        let (coordinator, _) =
            coordinator(transport.clone(), Arc::new(MemoryCredentialStore::new())).await;

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        // Let the exchange reach the network before the second caller arrives
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coordinator.is_refreshing());
        let second = coordinator.refresh().await;

        assert_eq!(first.await.unwrap(), second);
        assert_eq!(transport.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_settled_handle_is_dropped() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script_refresh(RefreshScript::Issue(CredentialPair::new("A2", "R2")));
        transport.script_refresh(RefreshScript::Issue(CredentialPair::new("A3", "R3")));
        let (coordinator, context) =
            coordinator(transport.clone(), Arc::new(MemoryCredentialStore::new())).await;

        coordinator.refresh().await.unwrap();
        let second = coordinator.refresh().await.unwrap();

        assert_eq!(second, CredentialPair::new("A3", "R3"));
        assert_eq!(transport.refresh_calls(), 2);
        assert_eq!(context.access_token().as_deref(), Some("A3"));
    }

    #[tokio::test]
    async fn test_failure_clears_store_and_expires() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_refresh_delay(Duration::from_millis(10));
        transport.script_refresh(RefreshScript::Reject(401));
        let store = Arc::new(MemoryCredentialStore::new());
        let (coordinator, context) = coordinator(transport.clone(), store.clone()).await;

        let results = futures::future::join_all((0..3).map(|_| coordinator.refresh())).await;

        for result in results {
            assert_eq!(result, Err(RefreshError::Rejected(ApiError::Unauthorized)));
        }
        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(store.get().unwrap(), None);
        assert_eq!(context.state(), SessionState::Expired);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_storage_failure_is_refresh_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script_refresh(RefreshScript::Issue(CredentialPair::new("A2", "R2")));
        let store = Arc::new(FailingStore::new());
        let (coordinator, context) = coordinator(transport, store.clone()).await;
        store.fail_puts(true);

        let result = coordinator.refresh().await;

        assert!(matches!(
            result,
            Err(RefreshError::Storage(StorageError::Io(_)))
        ));
        // Never serve credentials that did not make it to storage
        assert_eq!(context.access_token(), None);
        assert_eq!(store.get().unwrap(), None);
        assert_eq!(context.state(), SessionState::Expired);
    }

    #[tokio::test]
    async fn test_missing_session_does_not_call_endpoint() {
        let transport = Arc::new(ScriptedTransport::new());
        let context = Arc::new(SessionContext::new(Arc::new(MemoryCredentialStore::new())));
        let coordinator = RefreshCoordinator::new(context, AuthApi::new(transport.clone()));

        assert_eq!(coordinator.refresh().await, Err(RefreshError::MissingCredential));
        assert_eq!(transport.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_exchange() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_refresh_delay(Duration::from_millis(20));
        transport.script_refresh(RefreshScript::Issue(CredentialPair::new("A2", "R2")));
        let store = Arc::new(MemoryCredentialStore::new());
        let (coordinator, _) = coordinator(transport.clone(), store.clone()).await;

        // Give up on the refresh almost immediately
        let abandoned =
            tokio::time::timeout(Duration::from_millis(1), coordinator.refresh()).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(store.get().unwrap(), Some(CredentialPair::new("A2", "R2")));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_rejection_after_new_login_is_superseded() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_refresh_delay(Duration::from_millis(30));
        transport.script_refresh(RefreshScript::Issue(CredentialPair::new("A2", "R2")));
        let store = Arc::new(MemoryCredentialStore::new());
        let (coordinator, context) = coordinator(transport.clone(), store.clone()).await;

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // The backend revokes R1 when the new session is issued
        transport.accept_refresh("S1");
        context
            .establish(CredentialPair::new("B1", "S1"), None, None)
            .await
            .unwrap();

        assert_eq!(pending.await.unwrap(), Err(RefreshError::Superseded));
        assert_eq!(context.state(), SessionState::Authenticated);
        assert_eq!(context.access_token().as_deref(), Some("B1"));
        assert_eq!(store.get().unwrap(), Some(CredentialPair::new("B1", "S1")));
    }
}
