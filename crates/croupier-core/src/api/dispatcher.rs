use std::sync::Arc;

use super::client::{ApiRequest, ApiResponse, Transport};
use super::ApiError;
use crate::auth::session::SessionContext;

/// The credential a request went out with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedCredential {
    pub token: Option<String>,
    /// Session epoch the token belonged to
    pub epoch: u64,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Success(ApiResponse),
    /// HTTP 401; the decision what to do belongs to the session guard
    AuthenticationExpired(AttachedCredential),
    /// Every other failure, unchanged
    Failed(ApiError),
}

/// Sends requests with the current access credential attached.
pub struct RequestDispatcher {
    transport: Arc<dyn Transport>,
    context: Arc<SessionContext>,
}

impl RequestDispatcher {
    pub(crate) fn new(transport: Arc<dyn Transport>, context: Arc<SessionContext>) -> Self {
        Self { transport, context }
    }

    pub async fn send(&self, request: &ApiRequest) -> DispatchOutcome {
        let snapshot = self.context.snapshot();
        let attached = AttachedCredential {
            token: snapshot.token,
            epoch: snapshot.epoch,
        };

        let result = self.transport.execute(request, attached.token.as_deref()).await;
        match result {
            Ok(response) if response.is_success() => DispatchOutcome::Success(response),
            Ok(response) if response.status == 401 => DispatchOutcome::AuthenticationExpired(attached),
            Ok(response) => {
                DispatchOutcome::Failed(ApiError::from_status(response.status, &response.body))
            }
            Err(e) => DispatchOutcome::Failed(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TransportError;
    use crate::auth::{CredentialPair, MemoryCredentialStore};
    use crate::testing::ScriptedTransport;

    fn dispatcher(transport: Arc<ScriptedTransport>) -> (RequestDispatcher, Arc<SessionContext>) {
        let context = Arc::new(SessionContext::new(Arc::new(MemoryCredentialStore::new())));
        (RequestDispatcher::new(transport, context.clone()), context)
    }

    #[tokio::test]
    async fn test_attaches_current_access_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.accept_access("A1");
        let (dispatcher, context) = dispatcher(transport.clone());
        context
            .establish(CredentialPair::new("A1", "R1"), None, None)
            .await
            .unwrap();

        let outcome = dispatcher.send(&ApiRequest::get("/wallet")).await;
        assert!(matches!(outcome, DispatchOutcome::Success(_)));
        assert_eq!(transport.bearers_for("/wallet"), vec![Some("A1".to_string())]);
    }

    #[tokio::test]
    async fn test_classifies_401_with_presented_credential() {
        let transport = Arc::new(ScriptedTransport::new());
        let (dispatcher, context) = dispatcher(transport);
        context
            .establish(CredentialPair::new("A1", "R1"), None, None)
            .await
            .unwrap();

        match dispatcher.send(&ApiRequest::get("/wallet")).await {
            DispatchOutcome::AuthenticationExpired(attached) => {
                assert_eq!(attached.token.as_deref(), Some("A1"));
            }
            other => panic!("expected authentication expired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_failures_pass_through() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/tables/9", 404, "no such table");
        transport.fail_transport("/flaky");
        let (dispatcher, _) = dispatcher(transport);

        match dispatcher.send(&ApiRequest::get("/tables/9")).await {
            DispatchOutcome::Failed(ApiError::NotFound(body)) => assert_eq!(body, "no such table"),
            other => panic!("expected not found, got {:?}", other),
        }
        match dispatcher.send(&ApiRequest::get("/flaky")).await {
            DispatchOutcome::Failed(ApiError::Transport(TransportError::Connect(_))) => {}
            other => panic!("expected transport failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_anonymous_request_has_no_bearer() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/games", 200, "[]");
        let (dispatcher, _) = dispatcher(transport.clone());

        let outcome = dispatcher.send(&ApiRequest::get("/games")).await;
        assert!(matches!(outcome, DispatchOutcome::Success(_)));
        assert_eq!(transport.bearers_for("/games"), vec![None]);
    }
}
