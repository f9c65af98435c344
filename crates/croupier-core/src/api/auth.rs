//! Calls to the authentication endpoints.
//!
//! These bypass the session guard: login and refresh carry no bearer
//! token, and a refresh must never trigger another refresh.

use std::sync::Arc;

use reqwest::Method;
use tracing::{debug, info};

use super::client::{ApiRequest, ApiResponse, Transport};
use super::{ApiError, RefreshError};
use crate::models::{AuthResponse, LoginRequest, RefreshRequest, RegisterRequest};

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";

#[derive(Clone)]
pub struct AuthApi {
    transport: Arc<dyn Transport>,
}

impl AuthApi {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        two_factor_code: Option<&str>,
    ) -> Result<AuthResponse, ApiError> {
        let body = LoginRequest {
            identifier,
            password,
            two_factor_code,
        };
        let request = ApiRequest::json(Method::POST, LOGIN_PATH, &body)?;
        let auth = self.credential_exchange(&request).await?;
        info!(identifier = identifier, "Logged in");
        Ok(auth)
    }

    pub async fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
    ) -> Result<AuthResponse, ApiError> {
        let body = RegisterRequest {
            email,
            username,
            password,
        };
        let request = ApiRequest::json(Method::POST, REGISTER_PATH, &body)?;
        let auth = self.credential_exchange(&request).await?;
        info!(username = username, "Registered");
        Ok(auth)
    }

    /// Exchange a refresh credential for a new pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, RefreshError> {
        let request = ApiRequest::json(Method::POST, REFRESH_PATH, &RefreshRequest { refresh_token })
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        let response = self
            .transport
            .execute(&request, None)
            .await
            .map_err(RefreshError::Transport)?;
        if !response.is_success() {
            return Err(RefreshError::Rejected(ApiError::from_status(
                response.status,
                &response.body,
            )));
        }

        let auth: AuthResponse = response
            .json()
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        if auth.access_token.is_empty() || auth.refresh_token.is_empty() {
            return Err(RefreshError::InvalidResponse(
                "missing access or refresh token".to_string(),
            ));
        }
        Ok(auth)
    }

    /// Tell the backend to revoke the session. The caller clears local
    /// state whatever this returns.
    pub async fn logout(&self, access_token: &str) -> Result<(), ApiError> {
        let request = ApiRequest::new(Method::POST, LOGOUT_PATH);
        let response = self.transport.execute(&request, Some(access_token)).await?;
        Self::check_response(response)?;
        debug!("Logout acknowledged");
        Ok(())
    }

    async fn credential_exchange(&self, request: &ApiRequest) -> Result<AuthResponse, ApiError> {
        let response = self.transport.execute(request, None).await?;
        if response.status == 401 {
            return Err(ApiError::InvalidCredentials);
        }
        let response = Self::check_response(response)?;
        let auth: AuthResponse = response.json()?;
        if auth.access_token.is_empty() || auth.refresh_token.is_empty() {
            return Err(ApiError::InvalidResponse(
                "missing access or refresh token".to_string(),
            ));
        }
        Ok(auth)
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }
}
