//! Network seam for the API client.
//!
//! [`Transport`] executes one fully-formed request and reports whatever
//! status came back. It knows nothing about refresh or retries; that
//! lives in [`super::ApiClient`].

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::cookies::{cookies_path, CookieFile};
use crate::config::AuthMode;
use crate::error::Error;
use crate::Result;

/// A request as it goes out on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    /// Path relative to the backend base URL, e.g. `/authenticate/me`
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Bearer token, present only in token mode
    pub bearer: Option<String>,
}

/// Status and raw body of a response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Decode the body as JSON. An empty body decodes as `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let body = self.body.trim();
        let body = if body.is_empty() { "null" } else { body };
        Ok(serde_json::from_str(body)?)
    }
}

/// Executes requests against the backend.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse>;

    /// Drop any session cookies the transport holds.
    fn clear_cookies(&self) -> Result<()> {
        Ok(())
    }
}

/// Production transport backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    cookies: Option<Arc<CookieFile>>,
}

impl ReqwestTransport {
    /// Build a transport for `base_url`.
    ///
    /// Cookie-mode deployments get the persistent jar at [`cookies_path`];
    /// token mode carries no cookies at all.
    pub fn new(base_url: &str, mode: AuthMode, timeout: Duration) -> Result<Self> {
        Url::parse(base_url)?;
        let cookies = match mode {
            AuthMode::Cookie => Some(Arc::new(CookieFile::open(cookies_path())?)),
            AuthMode::Token => None,
        };
        Self::build(base_url, cookies, timeout)
    }

    /// Build a cookie-mode transport around an existing jar.
    pub fn with_cookies(base_url: &str, cookies: Arc<CookieFile>, timeout: Duration) -> Result<Self> {
        Self::build(base_url, Some(cookies), timeout)
    }

    fn build(base_url: &str, cookies: Option<Arc<CookieFile>>, timeout: Duration) -> Result<Self> {
        Url::parse(base_url)?;
        let mut builder = Client::builder().timeout(timeout);
        if let Some(jar) = &cookies {
            builder = builder.cookie_provider(jar.clone());
        }
        Ok(Self {
            client: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            cookies,
        })
    }

    fn url_for(&self, request: &HttpRequest) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, request.path))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let url = self.url_for(request)?;
        tracing::debug!(method = %request.method, url = %url, "Dispatching request");

        let mut builder = self.client.request(request.method.clone(), url);
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Network(format!("request to {} timed out", request.path))
            } else {
                Error::Http(e)
            }
        })?;

        let status = response.status();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }

    fn clear_cookies(&self) -> Result<()> {
        match &self.cookies {
            Some(jar) => jar.clear(),
            None => Ok(()),
        }
    }
}

/// Scripted transport for tests.
///
/// Replies are queued per `(method, path)`; the last reply for a route
/// repeats once the queue runs dry. Every request is recorded.
#[cfg(test)]
pub struct FakeTransport {
    routes: std::sync::Mutex<std::collections::HashMap<(Method, String), std::collections::VecDeque<FakeReply>>>,
    calls: std::sync::Mutex<Vec<HttpRequest>>,
    delays: std::sync::Mutex<std::collections::HashMap<(Method, String), Duration>>,
    cookies_cleared: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
#[derive(Debug, Clone)]
enum FakeReply {
    Respond(HttpResponse),
    Fail(String),
}

#[cfg(test)]
impl FakeTransport {
    pub fn new() -> Self {
        Self {
            routes: std::sync::Mutex::new(std::collections::HashMap::new()),
            calls: std::sync::Mutex::new(Vec::new()),
            delays: std::sync::Mutex::new(std::collections::HashMap::new()),
            cookies_cleared: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Hold every reply on a route for `delay`.
    pub fn delay(self, method: Method, path: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert((method, path.to_string()), delay);
        self
    }

    /// Number of times the cookie jar was cleared.
    pub fn cookies_cleared(&self) -> usize {
        self.cookies_cleared.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Queue a JSON reply for a route.
    pub fn reply(self, method: Method, path: &str, status: u16, body: Value) -> Self {
        let response = HttpResponse::new(StatusCode::from_u16(status).unwrap(), body.to_string());
        self.push(method, path, FakeReply::Respond(response));
        self
    }

    /// Queue a transport-level failure for a route.
    pub fn fail(self, method: Method, path: &str, message: &str) -> Self {
        self.push(method, path, FakeReply::Fail(message.to_string()));
        self
    }

    fn push(&self, method: Method, path: &str, reply: FakeReply) {
        self.routes
            .lock()
            .unwrap()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
    }

    /// All requests seen so far.
    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of requests seen for one route.
    pub fn count(&self, method: Method, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for FakeTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.calls.lock().unwrap().push(request.clone());

        let key = (request.method.clone(), request.path.clone());
        let delay = self.delays.lock().unwrap().get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reply = {
            let mut routes = self.routes.lock().unwrap();
            let queue = routes.get_mut(&(request.method.clone(), request.path.clone()));
            match queue {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply {
            Some(FakeReply::Respond(response)) => Ok(response),
            Some(FakeReply::Fail(message)) => Err(Error::Network(message)),
            None => Ok(HttpResponse::new(
                StatusCode::NOT_FOUND,
                r#"{"detail": "Not Found"}"#,
            )),
        }
    }

    fn clear_cookies(&self) -> Result<()> {
        self.cookies_cleared.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
