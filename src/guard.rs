//! Route guard.
//!
//! Decides whether a route may render for the current session. While the
//! session is still loading the decision is [`GuardDecision::Pending`]:
//! redirecting then would bounce a user whose credentials are still being
//! checked to the sign-in page.

use std::fmt;
use tokio::sync::watch;

use crate::session::SessionState;

/// Application routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Home,
    Chat,
    About,
    Blog,
    Settings,
    Auth,
    GoogleCallback,
    Dashboard,
}

impl Route {
    pub const ALL: [Route; 8] = [
        Route::Home,
        Route::Chat,
        Route::About,
        Route::Blog,
        Route::Settings,
        Route::Auth,
        Route::GoogleCallback,
        Route::Dashboard,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            Route::Home => "/",
            Route::Chat => "/chat",
            Route::About => "/about",
            Route::Blog => "/blog",
            Route::Settings => "/settings",
            Route::Auth => "/auth",
            Route::GoogleCallback => "/auth/google/callback",
            Route::Dashboard => "/dashboard",
        }
    }

    /// Routes that require an authenticated session
    pub fn is_protected(&self) -> bool {
        matches!(self, Route::Dashboard)
    }

    /// Match a path, ignoring query and trailing slash. Unknown paths fall
    /// back to home.
    pub fn from_path(path: &str) -> Route {
        let path = path.split(['?', '#']).next().unwrap_or("");
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        match path {
            "/home" => Route::Home,
            _ => Route::ALL
                .into_iter()
                .find(|route| route.path() == path)
                .unwrap_or(Route::Home),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Outcome of guarding a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// Session not resolved yet; show a neutral loading state
    Pending,
    /// Navigate elsewhere instead of rendering
    Redirect(Route),
    /// Render the route
    Render(Route),
}

impl GuardDecision {
    pub fn is_pending(&self) -> bool {
        matches!(self, GuardDecision::Pending)
    }
}

/// Gates protected routes on the session
#[derive(Debug, Clone, Copy)]
pub struct RouteGuard {
    login_route: Route,
}

impl Default for RouteGuard {
    fn default() -> Self {
        Self {
            login_route: Route::Auth,
        }
    }
}

impl RouteGuard {
    pub fn new(login_route: Route) -> Self {
        Self { login_route }
    }

    pub fn evaluate(&self, route: Route, state: &SessionState) -> GuardDecision {
        if !route.is_protected() {
            return GuardDecision::Render(route);
        }
        match state {
            SessionState::Uninitialized | SessionState::Loading => GuardDecision::Pending,
            SessionState::Authenticated(_) => GuardDecision::Render(route),
            SessionState::Anonymous => GuardDecision::Redirect(self.login_route),
        }
    }

    /// Wait until the session has resolved, then decide.
    ///
    /// Returns `Pending` only if the session manager went away before
    /// bootstrap finished.
    pub async fn resolve(&self, route: Route, rx: &mut watch::Receiver<SessionState>) -> GuardDecision {
        match rx.wait_for(|state| !state.is_loading()).await {
            Ok(state) => self.evaluate(route, &state),
            Err(_) => GuardDecision::Pending,
        }
    }

    /// Wait for the next session transition and re-evaluate.
    ///
    /// Returns `None` once the session manager is gone.
    pub async fn next_decision(
        &self,
        route: Route,
        rx: &mut watch::Receiver<SessionState>,
    ) -> Option<GuardDecision> {
        rx.changed().await.ok()?;
        let state = rx.borrow_and_update();
        Some(self.evaluate(route, &state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialPair, MemoryTokenStore};
    use crate::http::{ApiClient, ApiRequest, CredentialMode, FakeTransport, LOGIN_PATH, ME_PATH, REFRESH_PATH};
    use crate::session::{SessionManager, UserProfile};
    use reqwest::Method;
    use serde_json::json;
    use std::sync::Arc;

    fn user() -> SessionState {
        let profile: UserProfile = serde_json::from_value(json!({"id": 1, "email": "u@x.com"})).unwrap();
        SessionState::Authenticated(profile)
    }

    #[test]
    fn test_public_routes_always_render() {
        let guard = RouteGuard::default();
        for state in [SessionState::Loading, SessionState::Anonymous, user()] {
            assert_eq!(guard.evaluate(Route::Blog, &state), GuardDecision::Render(Route::Blog));
        }
    }

    #[test]
    fn test_protected_route_decisions() {
        let guard = RouteGuard::default();
        assert_eq!(guard.evaluate(Route::Dashboard, &SessionState::Uninitialized), GuardDecision::Pending);
        assert_eq!(guard.evaluate(Route::Dashboard, &SessionState::Loading), GuardDecision::Pending);
        assert_eq!(
            guard.evaluate(Route::Dashboard, &SessionState::Anonymous),
            GuardDecision::Redirect(Route::Auth)
        );
        assert_eq!(guard.evaluate(Route::Dashboard, &user()), GuardDecision::Render(Route::Dashboard));
    }

    #[test]
    fn test_custom_login_route() {
        let guard = RouteGuard::new(Route::Home);
        assert_eq!(
            guard.evaluate(Route::Dashboard, &SessionState::Anonymous),
            GuardDecision::Redirect(Route::Home)
        );
    }

    #[test]
    fn test_from_path() {
        assert_eq!(Route::from_path("/dashboard"), Route::Dashboard);
        assert_eq!(Route::from_path("/dashboard/"), Route::Dashboard);
        assert_eq!(Route::from_path("/auth/google/callback?code=abc"), Route::GoogleCallback);
        assert_eq!(Route::from_path("/home"), Route::Home);
        assert_eq!(Route::from_path(""), Route::Home);
        assert_eq!(Route::from_path("/nowhere"), Route::Home);
    }

    #[tokio::test]
    async fn test_resolve_waits_for_bootstrap() {
        let fake = Arc::new(FakeTransport::new().reply(Method::GET, ME_PATH, 200, json!({"id": 1, "email": "u@x.com"})));
        let store = MemoryTokenStore::with_pair(CredentialPair::new("a", "r").unwrap());
        let manager = SessionManager::new(ApiClient::new(fake, CredentialMode::Token(Arc::new(store))));
        let guard = RouteGuard::default();

        let mut rx = manager.subscribe();
        assert!(guard.evaluate(Route::Dashboard, &rx.borrow()).is_pending());

        let waiter = tokio::spawn(async move { guard.resolve(Route::Dashboard, &mut rx).await });
        manager.bootstrap().await;

        assert_eq!(waiter.await.unwrap(), GuardDecision::Render(Route::Dashboard));
    }

    #[tokio::test]
    async fn test_guard_reacts_to_expired_session() {
        let fake = Arc::new(
            FakeTransport::new()
                .reply(Method::GET, ME_PATH, 200, json!({"id": 1, "email": "u@x.com"}))
                .reply(Method::GET, "/leads/", 401, json!({"detail": "Token expired"}))
                .reply(Method::POST, REFRESH_PATH, 401, json!({"detail": "Invalid or expired refresh token"})),
        );
        let store = MemoryTokenStore::with_pair(CredentialPair::new("a", "r").unwrap());
        let manager = SessionManager::new(ApiClient::new(fake, CredentialMode::Token(Arc::new(store))));
        let guard = RouteGuard::default();
        let mut rx = manager.subscribe();

        manager.bootstrap().await;
        assert_eq!(guard.resolve(Route::Dashboard, &mut rx).await, GuardDecision::Render(Route::Dashboard));

        let result: crate::Result<serde_json::Value> = manager.authorized(&ApiRequest::get("/leads/")).await;
        assert!(result.is_err());
        assert_eq!(
            guard.next_decision(Route::Dashboard, &mut rx).await,
            Some(GuardDecision::Redirect(Route::Auth))
        );
    }

    #[tokio::test]
    async fn test_guard_redirects_after_logout() {
        let fake = Arc::new(
            FakeTransport::new()
                .reply(Method::POST, LOGIN_PATH, 200, json!({"access_token": "a", "refresh_token": "r"}))
                .reply(Method::GET, ME_PATH, 200, json!({"id": 1, "email": "u@x.com"})),
        );
        let manager = SessionManager::new(ApiClient::new(
            fake,
            CredentialMode::Token(Arc::new(MemoryTokenStore::new())),
        ));
        let guard = RouteGuard::default();
        manager.bootstrap().await;

        let mut rx = manager.subscribe();
        assert_eq!(guard.resolve(Route::Dashboard, &mut rx).await, GuardDecision::Redirect(Route::Auth));

        assert!(manager.login("u@x.com", "good").await.is_success());
        assert_eq!(
            guard.next_decision(Route::Dashboard, &mut rx).await,
            Some(GuardDecision::Render(Route::Dashboard))
        );

        manager.logout().await;
        assert_eq!(
            guard.next_decision(Route::Dashboard, &mut rx).await,
            Some(GuardDecision::Redirect(Route::Auth))
        );
    }
}
