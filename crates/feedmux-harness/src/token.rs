//! Scripted token service
//!
//! Answers token requests from a queue of scripted results, falling back to a
//! fresh bearer token. Requests can be held until the test releases them, which
//! lets a test observe a renewal while it is still outstanding.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use feedmux_core::{
    AccessToken, DiscoveryRequest, RestError, ServiceEndpoint, TokenRequest, TokenService,
};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// One call to [`TokenService::request_token`]
#[derive(Debug, Clone)]
pub struct RecordedTokenRequest {
    pub request: TokenRequest,
    pub at: Instant,
}

#[derive(Debug)]
struct ServiceState {
    token_requests: Vec<RecordedTokenRequest>,
    discovery_requests: Vec<DiscoveryRequest>,
    scripted: VecDeque<Result<AccessToken, RestError>>,
    endpoints: Vec<ServiceEndpoint>,
    expires_in: Duration,
    refresh_tokens: bool,
    held: bool,
    issued: u32,
}

/// In-memory [`TokenService`]
#[derive(Debug)]
pub struct MockTokenService {
    state: Mutex<ServiceState>,
    released: Notify,
}

impl Default for MockTokenService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTokenService {
    /// Issues one-hour tokens without refresh tokens
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState {
                token_requests: Vec::new(),
                discovery_requests: Vec::new(),
                scripted: VecDeque::new(),
                endpoints: Vec::new(),
                expires_in: Duration::from_secs(3600),
                refresh_tokens: false,
                held: false,
                issued: 0,
            }),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_expires_in(&self, expires_in: Duration) {
        self.lock().expires_in = expires_in;
    }

    /// Attach a refresh token to generated tokens
    pub fn issue_refresh_tokens(&self, enabled: bool) {
        self.lock().refresh_tokens = enabled;
    }

    /// Answer the next request with `result` instead of a generated token
    pub fn push_result(&self, result: Result<AccessToken, RestError>) {
        self.lock().scripted.push_back(result);
    }

    pub fn set_endpoints(&self, endpoints: Vec<ServiceEndpoint>) {
        self.lock().endpoints = endpoints;
    }

    /// Park token requests until [`release`](Self::release)
    pub fn hold(&self) {
        self.lock().held = true;
    }

    pub fn release(&self) {
        self.lock().held = false;
        self.released.notify_waiters();
    }

    pub fn token_requests(&self) -> Vec<RecordedTokenRequest> {
        self.lock().token_requests.clone()
    }

    pub fn discovery_requests(&self) -> Vec<DiscoveryRequest> {
        self.lock().discovery_requests.clone()
    }

    async fn wait_released(&self) {
        loop {
            let released = self.released.notified();
            if !self.lock().held {
                return;
            }
            released.await;
        }
    }
}

#[async_trait]
impl TokenService for MockTokenService {
    async fn request_token(&self, request: TokenRequest) -> Result<AccessToken, RestError> {
        trace!(grant = request.grant.name(), "token requested");
        self.lock().token_requests.push(RecordedTokenRequest {
            request,
            at: Instant::now(),
        });
        self.wait_released().await;

        let mut state = self.lock();
        if let Some(result) = state.scripted.pop_front() {
            return result;
        }
        state.issued += 1;
        let token = AccessToken::bearer(format!("token-{}", state.issued), state.expires_in);
        Ok(if state.refresh_tokens {
            token.with_refresh_token(format!("refresh-{}", state.issued))
        } else {
            token
        })
    }

    async fn discover_endpoints(
        &self,
        request: DiscoveryRequest,
    ) -> Result<Vec<ServiceEndpoint>, RestError> {
        let mut state = self.lock();
        state.discovery_requests.push(request);
        if state.endpoints.is_empty() {
            return Err(RestError::new(Some(404), "no endpoints advertised"));
        }
        Ok(state.endpoints.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedmux_core::TokenGrant;
    use std::sync::Arc;

    fn create_test_request() -> TokenRequest {
        TokenRequest {
            url: "https://auth.example/token".into(),
            client_id: "client".into(),
            scope: "trapi".into(),
            grant: TokenGrant::Password {
                user_name: "alice".into(),
                password: "secret".into(),
            },
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_scripted_results_come_first() {
        let service = MockTokenService::new();
        service.push_result(Err(RestError::new(Some(503), "unavailable")));

        let first = service.request_token(create_test_request()).await;
        assert_eq!(first.unwrap_err().status, Some(503));

        let second = service.request_token(create_test_request()).await.unwrap();
        assert_eq!(second.access_token, "token-1");
        assert_eq!(service.token_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_held_request_waits_for_release() {
        let service = Arc::new(MockTokenService::new());
        service.hold();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.request_token(create_test_request()).await }
        });
        while service.token_requests().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());

        service.release();
        let token = task.await.unwrap().unwrap();
        assert_eq!(token.access_token, "token-1");
    }
}
