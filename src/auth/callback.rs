//! Google sign-in callback
//!
//! The backend redirects the browser to `/auth/google/callback?code=...`
//! once Google has authorized the user. This module parses that callback,
//! exchanges the code through the session manager, and decides where to
//! navigate afterwards. [`wait_for_callback`] lets the CLI receive the
//! redirect on a loopback port.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;
use crate::Result;
use crate::error::Error;
use crate::guard::Route;
use crate::session::SessionManager;

/// Page shown in the browser after the callback was captured
const RECEIVED_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Leadflow | Signing you in</title>
    <style>
        body {
            background-color: #0b0e14;
            color: #e2e8f0;
            font-family: 'Inter', -apple-system, system-ui, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            text-align: center;
        }
        h1 { font-size: 24px; color: #10b981; }
        p { font-size: 15px; color: #94a3b8; line-height: 1.6; }
    </style>
</head>
<body>
    <div>
        <h1>Google sign-in received</h1>
        <p>You can close this window and return to your terminal.</p>
    </div>
</body>
</html>"#;

/// Page shown when the callback carried an error or no code
const ERROR_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Leadflow | Authentication Failed</title>
    <style>
        body {
            background-color: #0b0e14;
            color: #e2e8f0;
            font-family: 'Inter', -apple-system, system-ui, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            text-align: center;
        }
        h1 { font-size: 24px; color: #ef4444; }
        p { font-size: 15px; color: #94a3b8; line-height: 1.6; }
    </style>
</head>
<body>
    <div>
        <h1>Authentication Failed</h1>
        <p>There was an error signing you in with Google.<br>Please try again from your terminal.</p>
    </div>
</body>
</html>"#;

/// Query parameters delivered to the callback route
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parse from a full URL, a path with query, or a bare query string
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let url = if input.starts_with("http://") || input.starts_with("https://") {
            Url::parse(input)
        } else if input.starts_with('/') {
            Url::parse(&format!("http://localhost{}", input))
        } else {
            Url::parse(&format!("http://localhost/?{}", input.trim_start_matches('?')))
        }
        .map_err(|e| Error::OAuth(format!("Failed to parse callback URL: {}", e)))?;

        let mut params = CallbackParams::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" if !value.is_empty() => params.code = Some(value.to_string()),
                "error" => params.error = Some(value.to_string()),
                "error_description" => params.error_description = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(params)
    }

    /// Authorization code, or why there is none
    pub fn authorization_code(&self) -> Result<&str> {
        if let Some(err) = &self.error {
            let description = self.error_description.as_deref().unwrap_or("Unknown error");
            return Err(Error::OAuth(format!("Authorization failed: {} - {}", err, description)));
        }
        self.code
            .as_deref()
            .ok_or_else(|| Error::OAuth("Missing authorization code".to_string()))
    }
}

/// Complete the Google sign-in and return the route to navigate to.
///
/// The dashboard is returned only after the exchange has resolved
/// successfully; every failure lands on the home route.
pub async fn handle_google_callback(manager: &SessionManager, params: &CallbackParams) -> Route {
    let code = match params.authorization_code() {
        Ok(code) => code,
        Err(e) => {
            tracing::warn!("Google callback rejected: {}", e);
            return Route::Home;
        }
    };

    let outcome = manager.google_login(code).await;
    if outcome.is_success() {
        Route::Dashboard
    } else {
        tracing::warn!("Google sign-in failed: {}", outcome.message());
        Route::Home
    }
}

/// Accept one browser redirect on `127.0.0.1:port` and return its parameters
pub async fn wait_for_callback(port: u16) -> Result<CallbackParams> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await
        .map_err(|e| Error::OAuth(format!("Failed to start callback server on {}: {}", addr, e)))?;

    tracing::info!("Callback server listening on http://{}", addr);

    loop {
        let (mut socket, _) = listener.accept().await
            .map_err(|e| Error::OAuth(format!("Failed to accept connection: {}", e)))?;

        let mut buffer = vec![0u8; 4096];
        let n = socket.read(&mut buffer).await
            .map_err(|e| Error::OAuth(format!("Failed to read request: {}", e)))?;
        let request = String::from_utf8_lossy(&buffer[..n]);

        let Some(target) = request_target(&request) else {
            let _ = respond(&mut socket, "400 Bad Request", ERROR_HTML).await;
            continue;
        };

        // Browsers ask for a favicon alongside the redirect.
        if Route::from_path(target) != Route::GoogleCallback {
            let _ = respond(&mut socket, "404 Not Found", "").await;
            continue;
        }

        let params = CallbackParams::parse(target)?;
        let (status, body) = match params.authorization_code() {
            Ok(_) => ("200 OK", RECEIVED_HTML),
            Err(_) => ("400 Bad Request", ERROR_HTML),
        };
        let _ = respond(&mut socket, status, body).await;
        return Ok(params);
    }
}

/// Loopback URL the backend should redirect to
pub fn redirect_uri(port: u16) -> String {
    format!("http://127.0.0.1:{}{}", port, Route::GoogleCallback.path())
}

/// Path and query from `GET /path?query HTTP/1.1`
fn request_target(request: &str) -> Option<&str> {
    let first_line = request.lines().next()?;
    let mut parts = first_line.split_whitespace();
    let _method = parts.next()?;
    parts.next()
}

async fn respond(socket: &mut tokio::net::TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryTokenStore;
    use crate::http::{ApiClient, CredentialMode, FakeTransport, GOOGLE_CALLBACK_PATH};
    use reqwest::Method;
    use serde_json::json;
    use std::sync::Arc;

    fn manager(fake: FakeTransport) -> (Arc<FakeTransport>, SessionManager) {
        let fake = Arc::new(fake);
        let client = ApiClient::new(fake.clone(), CredentialMode::Token(Arc::new(MemoryTokenStore::new())));
        (fake, SessionManager::new(client))
    }

    #[test]
    fn test_parse_full_url() {
        let params = CallbackParams::parse("http://localhost:3000/auth/google/callback?code=abc&scope=email").unwrap();
        assert_eq!(params.code.as_deref(), Some("abc"));
        assert!(params.error.is_none());
    }

    #[test]
    fn test_parse_bare_query() {
        let params = CallbackParams::parse("?code=abc").unwrap();
        assert_eq!(params.authorization_code().unwrap(), "abc");
    }

    #[test]
    fn test_parse_error() {
        let params = CallbackParams::parse("/auth/google/callback?error=access_denied&error_description=User+denied").unwrap();
        let err = params.authorization_code().unwrap_err().to_string();
        assert!(err.contains("access_denied"));
        assert!(err.contains("User denied"));
    }

    #[test]
    fn test_empty_code_is_missing() {
        let params = CallbackParams::parse("/auth/google/callback?code=").unwrap();
        assert!(params.authorization_code().is_err());
    }

    #[test]
    fn test_request_target() {
        let request = "GET /auth/google/callback?code=abc123 HTTP/1.1\r\nHost: localhost\r\n\r\n";
        assert_eq!(request_target(request), Some("/auth/google/callback?code=abc123"));
        assert_eq!(request_target(""), None);
    }

    #[test]
    fn test_redirect_uri() {
        assert_eq!(redirect_uri(3000), "http://127.0.0.1:3000/auth/google/callback");
    }

    #[tokio::test]
    async fn test_callback_navigates_to_dashboard_after_exchange() {
        let fake = FakeTransport::new().reply(
            Method::GET,
            GOOGLE_CALLBACK_PATH,
            200,
            json!({"id": "6f1c7a52-2d0e-4b8e-9a51-0d0f7a3c1e11", "email": "g@x.com", "access_token": "a", "refresh_token": "r"}),
        );
        let (fake, manager) = manager(fake);
        manager.bootstrap().await;

        let params = CallbackParams::parse("?code=abc").unwrap();
        let route = handle_google_callback(&manager, &params).await;

        assert_eq!(route, Route::Dashboard);
        // By the time we navigate the session is already authenticated.
        assert!(manager.session().authenticated);
        assert_eq!(fake.count(Method::GET, GOOGLE_CALLBACK_PATH), 1);
    }

    #[tokio::test]
    async fn test_callback_error_goes_home_without_request() {
        let (fake, manager) = manager(FakeTransport::new());
        manager.bootstrap().await;

        let params = CallbackParams::parse("?error=access_denied").unwrap();
        let route = handle_google_callback(&manager, &params).await;

        assert_eq!(route, Route::Home);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_callback_failed_exchange_goes_home() {
        let fake = FakeTransport::new()
            .reply(Method::GET, GOOGLE_CALLBACK_PATH, 400, json!({"detail": "Invalid authorization code"}));
        let (_fake, manager) = manager(fake);
        manager.bootstrap().await;

        let params = CallbackParams::parse("?code=stale").unwrap();
        assert_eq!(handle_google_callback(&manager, &params).await, Route::Home);
        assert!(!manager.session().authenticated);
    }

    #[tokio::test]
    async fn test_wait_for_callback_skips_favicon() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = tokio::spawn(wait_for_callback(port));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        for target in ["/favicon.ico", "/auth/google/callback?code=xyz"] {
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream
                .write_all(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", target).as_bytes())
                .await
                .unwrap();
            let mut reply = String::new();
            stream.read_to_string(&mut reply).await.unwrap();
        }

        let params = server.await.unwrap().unwrap();
        assert_eq!(params.code.as_deref(), Some("xyz"));
    }
}
