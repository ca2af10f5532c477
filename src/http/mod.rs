//! API client with silent credential refresh.
//!
//! This module provides:
//! - [`ApiClient`]: one configured client shared by every caller
//! - [`ApiRequest`]: a replayable request description
//! - [`Attempt`]: the per-request retry marker
//! - [`Transport`]: the network seam, with a `reqwest` implementation
//!
//! # Refresh protocol
//!
//! A 401 on a request that has not been retried triggers exactly one
//! refresh. If the refresh succeeds the original request is replayed once,
//! unmodified. If it fails the original 401 is returned. A replayed request
//! that gets another 401 is returned as-is.

mod cookies;
mod transport;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::auth::{CredentialPair, FileTokenStore, TokenStore};
use crate::config::{AuthMode, Config};
use crate::error::Error;
use crate::Result;

pub use cookies::{cookies_path, CookieFile};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};

#[cfg(test)]
pub use transport::FakeTransport;

pub const LOGIN_PATH: &str = "/authenticate/login";
pub const REGISTER_PATH: &str = "/authenticate/register";
pub const ME_PATH: &str = "/authenticate/me";
pub const REFRESH_PATH: &str = "/authenticate/refresh";
pub const LOGOUT_PATH: &str = "/authenticate/logout";
pub const GOOGLE_CALLBACK_PATH: &str = "/oauth/google/callback";

/// Whether a request has already been replayed after a refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attempt {
    pub retried: bool,
}

impl Attempt {
    /// A request that has not been retried yet
    pub fn first() -> Self {
        Self { retried: false }
    }

    fn retry(self) -> Self {
        Self { retried: true }
    }
}

/// A request that can be dispatched, and replayed, by [`ApiClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Never intercept a 401 on this request
    pub skip_refresh: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            skip_refresh: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Used for the auth endpoints themselves, where a 401 means bad input.
    pub fn without_refresh(mut self) -> Self {
        self.skip_refresh = true;
        self
    }
}

/// Credential mechanism bound to a client.
#[derive(Clone)]
pub enum CredentialMode {
    /// Bearer header from the token store
    Token(Arc<dyn TokenStore>),
    /// Cookie jar inside the transport
    Cookie,
}

/// Token payload returned by login, refresh and Google exchange.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Convert into a pair, keeping `previous_refresh` if the backend did
    /// not rotate the refresh token.
    pub fn into_pair(self, previous_refresh: Option<&str>) -> Result<CredentialPair> {
        let refresh = self
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string))
            .unwrap_or_default();
        let mut pair = CredentialPair::new(self.access_token, refresh)?;
        if let Some(token_type) = self.token_type {
            pair.token_type = token_type;
        }
        Ok(pair)
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    mode: CredentialMode,
    refresh_lock: Mutex<()>,
}

/// Shared API client.
///
/// Cheap to clone; clones share the transport, the credential store and
/// the refresh lock.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, mode: CredentialMode) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                mode,
                refresh_lock: Mutex::new(()),
            }),
        }
    }

    /// Build the production client described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.base_url, config.auth_mode, config.timeout())?;
        let mode = match config.auth_mode {
            AuthMode::Token => CredentialMode::Token(Arc::new(FileTokenStore::default())),
            AuthMode::Cookie => CredentialMode::Cookie,
        };
        Ok(Self::new(Arc::new(transport), mode))
    }

    /// Token store, when running in token mode
    pub fn token_store(&self) -> Option<&Arc<dyn TokenStore>> {
        match &self.inner.mode {
            CredentialMode::Token(store) => Some(store),
            CredentialMode::Cookie => None,
        }
    }

    /// Remove locally held credentials. Failures are logged.
    pub fn clear_credentials(&self) {
        let result = match &self.inner.mode {
            CredentialMode::Token(store) => store.clear(),
            CredentialMode::Cookie => self.inner.transport.clear_cookies(),
        };
        if let Err(e) = result {
            tracing::warn!("Failed to clear stored credentials: {}", e);
        }
    }

    /// Dispatch a request and decode a successful JSON body.
    pub async fn request<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        self.send(request, Attempt::first()).await?.json()
    }

    /// Dispatch a request, refreshing credentials at most once on 401.
    ///
    /// Returns the response for any 2xx status. Other statuses become
    /// [`Error::Api`], and a 401 that could not be cured becomes
    /// [`Error::Unauthorized`].
    pub async fn send(&self, request: &ApiRequest, attempt: Attempt) -> Result<HttpResponse> {
        let mut attempt = attempt;
        loop {
            let bearer = self.access_token()?;
            let response = self.dispatch(request, bearer.clone()).await?;

            if response.status != StatusCode::UNAUTHORIZED {
                return into_result(response);
            }

            let detail = error_detail(response.status, &response.body);
            if request.skip_refresh || attempt.retried {
                return Err(Error::Unauthorized {
                    detail,
                    session_expired: false,
                });
            }

            attempt = attempt.retry();
            tracing::debug!(path = %request.path, "Access rejected, attempting silent refresh");

            if let Err(e) = self.refresh(bearer.as_deref()).await {
                let session_expired = matches!(e, Error::Api { .. } | Error::Unauthorized { .. } | Error::Auth(_));
                tracing::warn!(path = %request.path, session_expired, "Silent refresh failed: {}", e);
                return Err(Error::Unauthorized {
                    detail,
                    session_expired,
                });
            }
        }
    }

    /// Obtain fresh credentials from the backend.
    ///
    /// `stale_access` is the access token the caller was rejected with. If
    /// another caller already rotated it while we waited for the lock, the
    /// new pair is reused instead of refreshing twice.
    pub async fn refresh(&self, stale_access: Option<&str>) -> Result<()> {
        let _guard = self.inner.refresh_lock.lock().await;

        match &self.inner.mode {
            CredentialMode::Cookie => {
                let request = ApiRequest::post(REFRESH_PATH).without_refresh();
                let response = self.dispatch(&request, None).await?;
                into_result(response)?;
                tracing::debug!("Session cookies refreshed");
                Ok(())
            }
            CredentialMode::Token(store) => {
                let pair = store
                    .load()?
                    .ok_or_else(|| Error::Auth("No refresh token stored".to_string()))?;

                if stale_access.is_some_and(|stale| stale != pair.access_token) {
                    tracing::debug!("Credentials already refreshed by a concurrent request");
                    return Ok(());
                }

                let request = ApiRequest::post(REFRESH_PATH)
                    .json(json!({ "refresh_token": pair.refresh_token }))
                    .without_refresh();

                // Only a rejection from the backend invalidates the stored
                // pair; a transport failure leaves it for the next attempt.
                let response = self.dispatch(&request, None).await?;
                let tokens = match into_result(response).and_then(|r| r.json::<TokenResponse>()) {
                    Ok(tokens) => tokens,
                    Err(e) => {
                        if matches!(e, Error::Api { .. }) {
                            store.clear()?;
                        }
                        return Err(e);
                    }
                };

                store.save(&tokens.into_pair(Some(&pair.refresh_token))?)?;
                tracing::debug!("Access token refreshed");
                Ok(())
            }
        }
    }

    fn access_token(&self) -> Result<Option<String>> {
        match &self.inner.mode {
            CredentialMode::Token(store) => Ok(store.load()?.map(|pair| pair.access_token)),
            CredentialMode::Cookie => Ok(None),
        }
    }

    async fn dispatch(&self, request: &ApiRequest, bearer: Option<String>) -> Result<HttpResponse> {
        let wire = HttpRequest {
            method: request.method.clone(),
            path: request.path.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
            bearer,
        };
        self.inner.transport.execute(&wire).await
    }
}

fn into_result(response: HttpResponse) -> Result<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }
    Err(Error::Api {
        status: response.status.as_u16(),
        detail: error_detail(response.status, &response.body),
    })
}

/// Human-readable message from an error body.
///
/// Prefers the backend's `detail`; validation errors carry a list whose
/// first `msg` is used.
pub fn error_detail(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => match value.get("detail") {
            Some(Value::String(detail)) => return detail.clone(),
            Some(Value::Array(items)) => {
                if let Some(msg) = items.iter().find_map(|i| i.get("msg").and_then(Value::as_str)) {
                    return msg.to_string();
                }
            }
            _ => {}
        },
        Err(_) => {
            let body = body.trim();
            if !body.is_empty() && body.len() <= 200 {
                return body.to_string();
            }
        }
    }

    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryTokenStore;

    fn token_client(fake: FakeTransport, store: MemoryTokenStore) -> (Arc<FakeTransport>, ApiClient) {
        let fake = Arc::new(fake);
        let client = ApiClient::new(fake.clone(), CredentialMode::Token(Arc::new(store)));
        (fake, client)
    }

    fn stored(access: &str, refresh: &str) -> MemoryTokenStore {
        MemoryTokenStore::with_pair(CredentialPair::new(access, refresh).unwrap())
    }

    #[tokio::test]
    async fn test_bearer_attached_in_token_mode() {
        let fake = FakeTransport::new().reply(Method::GET, ME_PATH, 200, json!({"id": 1}));
        let (fake, client) = token_client(fake, stored("a", "r"));

        client.send(&ApiRequest::get(ME_PATH), Attempt::first()).await.unwrap();

        let calls = fake.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].bearer.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_no_bearer_in_cookie_mode() {
        let fake = Arc::new(FakeTransport::new().reply(Method::GET, ME_PATH, 200, json!({})));
        let client = ApiClient::new(fake.clone(), CredentialMode::Cookie);

        client.send(&ApiRequest::get(ME_PATH), Attempt::first()).await.unwrap();

        assert!(fake.calls()[0].bearer.is_none());
    }

    #[tokio::test]
    async fn test_refresh_then_replay_once() {
        let fake = FakeTransport::new()
            .reply(Method::GET, "/leads/", 401, json!({"detail": "Token expired"}))
            .reply(Method::GET, "/leads/", 200, json!([]))
            .reply(Method::POST, REFRESH_PATH, 200, json!({"access_token": "a2", "refresh_token": "r2"}));
        let store = stored("a1", "r1");
        let (fake, client) = token_client(fake, store.clone());

        let request = ApiRequest::get("/leads/").query("industry", "saas");
        let response = client.send(&request, Attempt::first()).await.unwrap();
        assert!(response.is_success());

        let calls = fake.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].path, REFRESH_PATH);
        assert_eq!(calls[1].body, Some(json!({"refresh_token": "r1"})));
        assert!(calls[1].bearer.is_none());
        // Replay is the same request with the new credentials.
        assert_eq!(calls[2].method, calls[0].method);
        assert_eq!(calls[2].path, calls[0].path);
        assert_eq!(calls[2].query, calls[0].query);
        assert_eq!(calls[2].bearer.as_deref(), Some("a2"));

        let pair = store.load().unwrap().unwrap();
        assert_eq!(pair.access_token, "a2");
        assert_eq!(pair.refresh_token, "r2");
    }

    #[tokio::test]
    async fn test_always_401_refreshes_exactly_once() {
        let fake = FakeTransport::new()
            .reply(Method::GET, ME_PATH, 401, json!({"detail": "Not authenticated"}))
            .reply(Method::POST, REFRESH_PATH, 200, json!({"access_token": "a2", "refresh_token": "r2"}));
        let (fake, client) = token_client(fake, stored("a1", "r1"));

        let err = client.send(&ApiRequest::get(ME_PATH), Attempt::first()).await.unwrap_err();

        assert!(matches!(err, Error::Unauthorized { session_expired: false, .. }));
        assert_eq!(err.detail(), Some("Not authenticated"));
        assert_eq!(fake.count(Method::POST, REFRESH_PATH), 1);
        // Original plus one replay.
        assert_eq!(fake.count(Method::GET, ME_PATH), 2);
    }

    #[tokio::test]
    async fn test_retried_request_is_not_refreshed_again() {
        let fake = FakeTransport::new().reply(Method::GET, ME_PATH, 401, json!({"detail": "nope"}));
        let (fake, client) = token_client(fake, stored("a", "r"));

        let err = client
            .send(&ApiRequest::get(ME_PATH), Attempt { retried: true })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unauthorized { .. }));
        assert_eq!(fake.count(Method::POST, REFRESH_PATH), 0);
        assert_eq!(fake.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_rejected_returns_original_401_and_clears_store() {
        let fake = FakeTransport::new()
            .reply(Method::GET, ME_PATH, 401, json!({"detail": "Token expired"}))
            .reply(Method::POST, REFRESH_PATH, 401, json!({"detail": "Invalid or expired refresh token"}));
        let store = stored("a", "r");
        let (fake, client) = token_client(fake, store.clone());

        let err = client.send(&ApiRequest::get(ME_PATH), Attempt::first()).await.unwrap_err();

        assert!(err.is_session_expired());
        assert_eq!(err.detail(), Some("Token expired"));
        assert_eq!(fake.count(Method::GET, ME_PATH), 1);
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_network_failure_keeps_credentials() {
        let fake = FakeTransport::new()
            .reply(Method::GET, ME_PATH, 401, json!({"detail": "Token expired"}))
            .fail(Method::POST, REFRESH_PATH, "connection reset");
        let store = stored("a", "r");
        let (_fake, client) = token_client(fake, store.clone());

        let err = client.send(&ApiRequest::get(ME_PATH), Attempt::first()).await.unwrap_err();

        assert!(matches!(err, Error::Unauthorized { session_expired: false, .. }));
        assert!(store.load().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_auth_endpoints_are_not_intercepted() {
        let fake = FakeTransport::new()
            .reply(Method::POST, LOGIN_PATH, 401, json!({"detail": "Invalid credentials"}));
        let (fake, client) = token_client(fake, MemoryTokenStore::new());

        let request = ApiRequest::post(LOGIN_PATH).without_refresh();
        let err = client.send(&request, Attempt::first()).await.unwrap_err();

        assert_eq!(err.detail(), Some("Invalid credentials"));
        assert_eq!(fake.count(Method::POST, REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn test_cookie_mode_refresh_has_no_body() {
        let fake = Arc::new(
            FakeTransport::new()
                .reply(Method::GET, ME_PATH, 401, json!({}))
                .reply(Method::GET, ME_PATH, 200, json!({"id": 1}))
                .reply(Method::POST, REFRESH_PATH, 200, json!({"access_token": "a", "refresh_token": "r"})),
        );
        let client = ApiClient::new(fake.clone(), CredentialMode::Cookie);

        client.send(&ApiRequest::get(ME_PATH), Attempt::first()).await.unwrap();

        let calls = fake.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].body.is_none());
        assert!(calls.iter().all(|c| c.bearer.is_none()));
    }

    #[test]
    fn test_clear_credentials_in_cookie_mode_clears_jar() {
        let fake = Arc::new(FakeTransport::new());
        let client = ApiClient::new(fake.clone(), CredentialMode::Cookie);

        client.clear_credentials();

        assert_eq!(fake.cookies_cleared(), 1);
        assert!(client.token_store().is_none());
    }

    #[tokio::test]
    async fn test_refresh_reuses_rotated_pair() {
        let fake = FakeTransport::new();
        let (fake, client) = token_client(fake, stored("fresh", "r"));

        client.refresh(Some("stale")).await.unwrap();

        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_keeps_unrotated_refresh_token() {
        let fake = FakeTransport::new()
            .reply(Method::POST, REFRESH_PATH, 200, json!({"access_token": "a2"}));
        let store = stored("a1", "r1");
        let (_fake, client) = token_client(fake, store.clone());

        client.refresh(Some("a1")).await.unwrap();

        let pair = store.load().unwrap().unwrap();
        assert_eq!(pair.access_token, "a2");
        assert_eq!(pair.refresh_token, "r1");
    }

    #[tokio::test]
    async fn test_non_401_error_surfaces_detail() {
        let fake = FakeTransport::new()
            .reply(Method::GET, "/leads/42", 404, json!({"detail": "Lead not found"}));
        let (fake, client) = token_client(fake, stored("a", "r"));

        let err = client.send(&ApiRequest::get("/leads/42"), Attempt::first()).await.unwrap_err();

        assert!(matches!(err, Error::Api { status: 404, .. }));
        assert_eq!(err.detail(), Some("Lead not found"));
        assert_eq!(fake.count(Method::POST, REFRESH_PATH), 0);
    }

    #[test]
    fn test_error_detail_variants() {
        let validation = r#"{"detail": [{"loc": ["body", "email"], "msg": "value is not a valid email address"}]}"#;
        assert_eq!(
            error_detail(StatusCode::UNPROCESSABLE_ENTITY, validation),
            "value is not a valid email address"
        );
        assert_eq!(error_detail(StatusCode::BAD_GATEWAY, "upstream down"), "upstream down");
        assert_eq!(error_detail(StatusCode::BAD_GATEWAY, ""), "Bad Gateway");
        assert_eq!(error_detail(StatusCode::UNAUTHORIZED, "{}"), "Unauthorized");
    }
}
