//! In-process stand-ins for the backend and the credential store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::json;

use crate::api::auth::{LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH, REGISTER_PATH};
use crate::api::{ApiRequest, ApiResponse, StorageError, Transport, TransportError};
use crate::auth::{CredentialPair, CredentialStore, MemoryCredentialStore};

/// What the next call to the refresh endpoint does.
#[derive(Debug, Clone)]
pub enum RefreshScript {
    Issue(CredentialPair),
    Reject(u16),
    Unreachable,
}

#[derive(Default)]
struct Backend {
    login: Option<(CredentialPair, String)>,
    login_expires_in: Option<i64>,
    valid_access: Option<String>,
    valid_refresh: Option<String>,
    refresh_queue: VecDeque<RefreshScript>,
    fixed: HashMap<String, (u16, String)>,
    unreachable: HashSet<String>,
    always_unauthorized: HashSet<String>,
    seen: Vec<(String, Option<String>)>,
}

/// Behaves like the auth service: refresh credentials rotate and a used
/// one is rejected; any other path answers 200 for the current access
/// credential and 401 otherwise.
#[derive(Default)]
pub struct ScriptedTransport {
    backend: Mutex<Backend>,
    refresh_delay: Mutex<Duration>,
    refresh_calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn backend(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap()
    }

    pub fn set_login(&self, pair: CredentialPair, password: &str) {
        self.backend().login = Some((pair, password.to_string()));
    }

    pub fn set_login_expires_in(&self, secs: i64) {
        self.backend().login_expires_in = Some(secs);
    }

    pub fn accept_access(&self, token: &str) {
        self.backend().valid_access = Some(token.to_string());
    }

    pub fn accept_refresh(&self, token: &str) {
        self.backend().valid_refresh = Some(token.to_string());
    }

    /// Make the current access credential stale
    pub fn expire_access(&self) {
        self.backend().valid_access = None;
    }

    pub fn script_refresh(&self, script: RefreshScript) {
        self.backend().refresh_queue.push_back(script);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn respond(&self, path: &str, status: u16, body: &str) {
        self.backend()
            .fixed
            .insert(path.to_string(), (status, body.to_string()));
    }

    pub fn fail_transport(&self, path: &str) {
        self.backend().unreachable.insert(path.to_string());
    }

    pub fn reject_always(&self, path: &str) {
        self.backend().always_unauthorized.insert(path.to_string());
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Authorization tokens seen on `path`, in arrival order
    pub fn bearers_for(&self, path: &str) -> Vec<Option<String>> {
        self.backend()
            .seen
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, bearer)| bearer.clone())
            .collect()
    }

    fn body_field(request: &ApiRequest, field: &str) -> Option<String> {
        request
            .body
            .as_ref()
            .and_then(|b| b.get(field))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn issue(backend: &mut Backend, pair: &CredentialPair, expires_in: Option<i64>) -> ApiResponse {
        backend.valid_access = Some(pair.access_token.clone());
        backend.valid_refresh = Some(pair.refresh_token.clone());
        let mut body = json!({
            "accessToken": pair.access_token,
            "refreshToken": pair.refresh_token,
            "user": {"id": "u-1", "username": "player", "email": "player@example.com"},
        });
        if let Some(secs) = expires_in {
            body["expiresIn"] = json!(secs);
        }
        ApiResponse::new(200, body.to_string())
    }

    async fn refresh(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.refresh_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut backend = self.backend();
        let presented = Self::body_field(request, "refreshToken");
        if presented.is_none() || presented != backend.valid_refresh {
            return Ok(ApiResponse::new(401, "Invalid refresh token"));
        }
        match backend.refresh_queue.pop_front() {
            Some(RefreshScript::Issue(pair)) => {
                let mut response = Self::issue(&mut backend, &pair, None);
                let mut body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
                body.as_object_mut().unwrap().remove("user");
                response.body = body.to_string();
                Ok(response)
            }
            Some(RefreshScript::Reject(status)) => Ok(ApiResponse::new(status, "refresh rejected")),
            Some(RefreshScript::Unreachable) => {
                Err(TransportError::Connect("refresh endpoint unreachable".to_string()))
            }
            None => Ok(ApiResponse::new(500, "no refresh scripted")),
        }
    }

    fn handle(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, TransportError> {
        let mut backend = self.backend();
        let path = request.path.as_str();

        if path == LOGIN_PATH || path == REGISTER_PATH {
            let password = Self::body_field(request, "password");
            let Some((pair, expected)) = backend.login.clone() else {
                return Ok(ApiResponse::new(401, "Invalid credentials"));
            };
            if path == LOGIN_PATH && password.as_deref() != Some(expected.as_str()) {
                return Ok(ApiResponse::new(401, "Invalid credentials"));
            }
            let expires_in = backend.login_expires_in;
            return Ok(Self::issue(&mut backend, &pair, expires_in));
        }
        if path == LOGOUT_PATH {
            return Ok(ApiResponse::new(204, ""));
        }
        if let Some((status, body)) = backend.fixed.get(path) {
            return Ok(ApiResponse::new(*status, body.clone()));
        }
        if backend.always_unauthorized.contains(path) {
            return Ok(ApiResponse::new(401, "Unauthorized"));
        }

        match bearer {
            Some(token) if backend.valid_access.as_deref() == Some(token) => Ok(ApiResponse::new(
                200,
                json!({"path": path, "token": token}).to_string(),
            )),
            _ => Ok(ApiResponse::new(401, "Unauthorized")),
        }
    }
}

impl Transport for ScriptedTransport {
    fn execute<'a>(
        &'a self,
        request: &'a ApiRequest,
        bearer: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ApiResponse, TransportError>> {
        async move {
            let unreachable = {
                let mut backend = self.backend();
                backend
                    .seen
                    .push((request.path.clone(), bearer.map(str::to_string)));
                backend.unreachable.contains(&request.path)
            };
            if unreachable {
                return Err(TransportError::Connect(format!("{} unreachable", request.path)));
            }
            if request.path == REFRESH_PATH {
                return self.refresh(request).await;
            }
            self.handle(request, bearer)
        }
        .boxed()
    }
}

/// Memory store whose writes can be made to fail.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryCredentialStore,
    fail_puts: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

impl CredentialStore for FailingStore {
    fn get(&self) -> Result<Option<CredentialPair>, StorageError> {
        self.inner.get()
    }

    fn put(&self, pair: &CredentialPair) -> Result<(), StorageError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Io("injected write failure".to_string()));
        }
        self.inner.put(pair)
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear()
    }
}
