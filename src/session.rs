//! Auth session manager.
//!
//! [`SessionManager`] is the single source of truth for who is logged in and
//! the only component that changes the session. The current [`SessionState`]
//! is published on a `watch` channel; views, the route guard and the CLI
//! subscribe to it instead of reaching for a global.
//!
//! ```text
//! Uninitialized ──bootstrap──► Loading ──┬──► Authenticated ◄─┐
//!                                        │        │  ▲        │ re-login
//!                                        │ logout │  │ login  └──┘
//!                                        │ expiry ▼  │
//!                                        └──► Anonymous
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Field};
use crate::http::{
    ApiClient, ApiRequest, Attempt, TokenResponse, GOOGLE_CALLBACK_PATH, LOGIN_PATH, LOGOUT_PATH,
    ME_PATH, REGISTER_PATH,
};
use crate::Result;

/// Backend user identifier. Real deployments use UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    Uuid(uuid::Uuid),
    Number(i64),
    Text(String),
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::Uuid(id) => write!(f, "{}", id),
            UserId::Number(id) => write!(f, "{}", id),
            UserId::Text(id) => f.write_str(id),
        }
    }
}

/// Profile of the signed-in user, as returned by `/authenticate/me`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub profile_pic: Option<String>,
}

impl UserProfile {
    /// Name to greet the user with
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.email)
    }
}

/// Lifecycle of the session.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Loading,
    Authenticated(UserProfile),
    Anonymous,
}

impl SessionState {
    /// True until bootstrap has resolved. Not the same as anonymous.
    pub fn is_loading(&self) -> bool {
        matches!(self, SessionState::Uninitialized | SessionState::Loading)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }

    pub fn user(&self) -> Option<&UserProfile> {
        match self {
            SessionState::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    /// Whether moving to `next` is a legal transition
    pub fn can_transition(&self, next: &SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized, Loading)
                | (Loading, Authenticated(_))
                | (Loading, Anonymous)
                | (Authenticated(_), Anonymous)
                | (Authenticated(_), Authenticated(_))
                | (Anonymous, Authenticated(_))
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Loading => "loading",
            SessionState::Authenticated(_) => "authenticated",
            SessionState::Anonymous => "anonymous",
        }
    }

    /// Flattened view for consumers
    pub fn snapshot(&self) -> Session {
        Session {
            user: self.user().cloned(),
            authenticated: self.is_authenticated(),
            loading: self.is_loading(),
        }
    }
}

/// Snapshot of the session as consumers see it
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user: Option<UserProfile>,
    pub authenticated: bool,
    pub loading: bool,
}

/// Result of a public session operation. Operations never fail otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Success {
        message: String,
    },
    Failure {
        message: String,
        /// Set for validation failures caught before any request
        field: Option<Field>,
    },
}

impl AuthOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        AuthOutcome::Success {
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        AuthOutcome::Failure {
            message: message.into(),
            field: None,
        }
    }

    /// Convert an error, surfacing the backend's wording when present
    pub fn from_error(err: &Error, fallback: &str) -> Self {
        let field = match err {
            Error::Validation { field, .. } => Some(*field),
            _ => None,
        };
        AuthOutcome::Failure {
            message: err.detail().unwrap_or(fallback).to_string(),
            field,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AuthOutcome::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            AuthOutcome::Success { message } | AuthOutcome::Failure { message, .. } => message,
        }
    }
}

/// Registration form
#[derive(Debug, Clone, Serialize)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

fn required(field: Field, value: &str, message: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(field, message));
    }
    Ok(())
}

struct ManagerInner {
    client: ApiClient,
    state: watch::Sender<SessionState>,
    bootstrapped: AtomicBool,
}

/// Owns the session and every operation that changes it.
///
/// Construct one at the application root and hand clones to whatever needs
/// the session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(client: ApiClient) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        Self {
            inner: Arc::new(ManagerInner {
                client,
                state,
                bootstrapped: AtomicBool::new(false),
            }),
        }
    }

    pub fn client(&self) -> &ApiClient {
        &self.inner.client
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Current snapshot
    pub fn session(&self) -> Session {
        self.inner.state.borrow().snapshot()
    }

    /// Receiver notified on every session transition
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Attempt silent re-authentication. Runs once; later calls wait for
    /// the first one and return its result.
    pub async fn bootstrap(&self) -> Session {
        if self.inner.bootstrapped.swap(true, Ordering::SeqCst) {
            let mut rx = self.subscribe();
            let _ = rx.wait_for(|state| !state.is_loading()).await;
            return self.session();
        }

        self.transition(SessionState::Loading);

        let next = match self.restore().await {
            Ok(Some(user)) => SessionState::Authenticated(user),
            Ok(None) => SessionState::Anonymous,
            Err(e) => {
                tracing::debug!("Auto-login failed: {}", e);
                self.inner.client.clear_credentials();
                SessionState::Anonymous
            }
        };

        let restored = next.is_authenticated();
        if !self.settle(next) && restored {
            // Signed out while the profile was in flight.
            self.inner.client.clear_credentials();
        }

        self.session()
    }

    /// Resolve bootstrap, unless a logout already resolved the session.
    fn settle(&self, next: SessionState) -> bool {
        self.inner.state.send_if_modified(|current| {
            if !matches!(current, SessionState::Loading) {
                tracing::debug!(current = current.label(), "Session resolved before bootstrap finished");
                return false;
            }
            tracing::debug!(to = next.label(), "Bootstrap resolved");
            *current = next;
            true
        })
    }

    async fn restore(&self) -> Result<Option<UserProfile>> {
        if let Some(store) = self.inner.client.token_store() {
            if store.load()?.is_none() {
                return Ok(None);
            }
        }
        self.fetch_profile().await.map(Some)
    }

    /// Sign in with email and password.
    pub async fn login(&self, email: &str, password: &str) -> AuthOutcome {
        let valid = required(Field::Email, email, "Email is required")
            .and_then(|_| required(Field::Password, password, "Password is required"));
        if let Err(e) = valid {
            return AuthOutcome::from_error(&e, "Login failed");
        }
        if self.state().is_loading() {
            return AuthOutcome::failure("Session is still loading");
        }

        match self.try_login(email.trim(), password).await {
            Ok(user) => {
                tracing::info!(user = %user.id, "Logged in");
                self.transition(SessionState::Authenticated(user));
                AuthOutcome::success("Logged in successfully!")
            }
            Err(e) => {
                tracing::warn!("Login failed: {}", e);
                AuthOutcome::from_error(&e, "Login failed")
            }
        }
    }

    async fn try_login(&self, email: &str, password: &str) -> Result<UserProfile> {
        let request = ApiRequest::post(LOGIN_PATH)
            .json(json!({ "email": email, "password": password }))
            .without_refresh();
        let response = self.inner.client.send(&request, Attempt::first()).await?;

        let Some(store) = self.inner.client.token_store() else {
            return self.fetch_profile().await;
        };

        let previous = store.load().ok().flatten();
        let tokens: TokenResponse = response.json()?;
        store.save(&tokens.into_pair(None)?)?;

        match self.fetch_profile().await {
            Ok(user) => Ok(user),
            Err(e) => {
                // Leave the store as it was before this attempt.
                match previous {
                    Some(pair) if self.state().is_authenticated() => store.save(&pair)?,
                    _ => store.clear()?,
                }
                Err(e)
            }
        }
    }

    /// Register a new account. Does not sign the caller in.
    pub async fn signup(&self, form: &SignupRequest) -> AuthOutcome {
        let valid = required(Field::Username, &form.username, "Username is required")
            .and_then(|_| required(Field::Email, &form.email, "Email is required"))
            .and_then(|_| required(Field::Password, &form.password, "Password is required"));
        if let Err(e) = valid {
            return AuthOutcome::from_error(&e, "Signup failed");
        }

        let request = ApiRequest::post(REGISTER_PATH)
            .json(json!({
                "username": form.username.trim(),
                "email": form.email.trim(),
                "password": form.password,
            }))
            .without_refresh();

        match self.inner.client.send(&request, Attempt::first()).await {
            Ok(_) => {
                tracing::info!(username = %form.username.trim(), "Account registered");
                AuthOutcome::success("Account created successfully!")
            }
            Err(e) => {
                tracing::warn!("Signup failed: {}", e);
                AuthOutcome::from_error(&e, "Signup failed")
            }
        }
    }

    /// Exchange a Google authorization code for a session.
    pub async fn google_login(&self, code: &str) -> AuthOutcome {
        if let Err(e) = required(Field::Code, code, "Missing Google authorization code") {
            return AuthOutcome::from_error(&e, "Google login failed");
        }
        if self.state().is_loading() {
            return AuthOutcome::failure("Session is still loading");
        }

        match self.try_google_exchange(code.trim()).await {
            Ok(user) => {
                tracing::info!(user = %user.id, "Logged in with Google");
                self.transition(SessionState::Authenticated(user));
                AuthOutcome::success("Signed in with Google")
            }
            Err(e) => {
                tracing::warn!("Google login failed: {}", e);
                AuthOutcome::from_error(&e, "Google login failed")
            }
        }
    }

    async fn try_google_exchange(&self, code: &str) -> Result<UserProfile> {
        let request = ApiRequest::get(GOOGLE_CALLBACK_PATH)
            .query("code", code)
            .without_refresh();
        let body: Value = self.inner.client.request(&request).await?;

        // The profile is either nested under "user" or flattened alongside
        // the tokens.
        let profile = body.get("user").cloned().unwrap_or_else(|| body.clone());
        let user: UserProfile = serde_json::from_value(profile)?;

        if let Some(store) = self.inner.client.token_store() {
            let tokens: TokenResponse = serde_json::from_value(body).map_err(|_| {
                Error::OAuth("Google exchange returned no credentials".to_string())
            })?;
            store.save(&tokens.into_pair(None)?)?;
        }

        Ok(user)
    }

    /// Sign out. Local state is always cleared, even if the backend could
    /// not be told.
    pub async fn logout(&self) {
        let refresh_token = self
            .inner
            .client
            .token_store()
            .and_then(|store| store.load().ok().flatten())
            .map(|pair| pair.refresh_token);

        let mut request = ApiRequest::post(LOGOUT_PATH).without_refresh();
        if let Some(token) = refresh_token {
            request = request.json(json!({ "refresh_token": token }));
        }

        if let Err(e) = self.inner.client.send(&request, Attempt::first()).await {
            tracing::warn!("Logout notification failed: {}", e);
        }

        self.inner.client.clear_credentials();
        self.transition(SessionState::Anonymous);
        tracing::info!("Logged out");
    }

    /// Dispatch a request on behalf of a view.
    ///
    /// If the backend refuses to refresh the session, the session is reset
    /// to anonymous before the error is returned.
    pub async fn authorized<T: serde::de::DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        let result = self.inner.client.request(request).await;
        if let Err(e) = &result {
            self.expire_on_unauthorized(e);
        }
        result
    }

    /// Reset to anonymous when `err` means the session is gone for good.
    pub fn expire_on_unauthorized(&self, err: &Error) {
        if err.is_session_expired() && self.state().is_authenticated() {
            tracing::info!("Session expired");
            self.inner.client.clear_credentials();
            self.transition(SessionState::Anonymous);
        }
    }

    async fn fetch_profile(&self) -> Result<UserProfile> {
        self.inner.client.request(&ApiRequest::get(ME_PATH)).await
    }

    /// Apply `next` if the state machine allows it.
    fn transition(&self, next: SessionState) -> bool {
        let mut applied = false;
        self.inner.state.send_if_modified(|current| {
            if *current == next {
                applied = true;
                return false;
            }
            if !current.can_transition(&next) {
                tracing::warn!(from = current.label(), to = next.label(), "Rejected session transition");
                return false;
            }
            tracing::debug!(from = current.label(), to = next.label(), "Session transition");
            *current = next;
            applied = true;
            true
        });
        applied
    }
}
