//! Session cookies that outlive the process.
//!
//! Cookie-mode deployments keep the session in httpOnly cookies. Each CLI
//! invocation builds a fresh client, so the jar is mirrored to a JSON file
//! next to the config and replayed on start.

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use url::Url;

use crate::error::Error;
use crate::Result;

/// Get the default cookie file path
pub fn cookies_path() -> PathBuf {
    crate::config::config_dir().join("cookies.json")
}

/// One `Set-Cookie` header and the URL that sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SavedCookie {
    url: String,
    host: String,
    name: String,
    set_cookie: String,
}

#[derive(Default)]
struct JarState {
    jar: Jar,
    saved: Vec<SavedCookie>,
}

/// Cookie store backed by a file
pub struct CookieFile {
    path: PathBuf,
    state: RwLock<JarState>,
}

impl CookieFile {
    /// Open the jar at `path`, replaying whatever was saved there.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let saved: Vec<SavedCookie> = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = ?path, "Discarding unreadable cookie file: {}", e);
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let jar = Jar::default();
        for cookie in &saved {
            if let Ok(url) = Url::parse(&cookie.url) {
                jar.add_cookie_str(&cookie.set_cookie, &url);
            }
        }
        tracing::debug!(count = saved.len(), "Loaded session cookies");

        Ok(Self {
            path,
            state: RwLock::new(JarState { jar, saved }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forget every cookie, in memory and on disk
    pub fn clear(&self) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| Error::Other("cookie jar lock poisoned".to_string()))?;
        *state = JarState::default();

        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl CookieStore for CookieFile {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let headers: Vec<&HeaderValue> = cookie_headers.collect();
        let Ok(mut state) = self.state.write() else {
            return;
        };

        state.jar.set_cookies(&mut headers.iter().copied(), url);

        let host = url.host_str().unwrap_or_default().to_string();
        for header in &headers {
            let Ok(raw) = header.to_str() else { continue };
            let Some(name) = cookie_name(raw) else { continue };

            state.saved.retain(|c| !(c.host == host && c.name == name));
            state.saved.push(SavedCookie {
                url: url.to_string(),
                host: host.clone(),
                name: name.to_string(),
                set_cookie: raw.to_string(),
            });
        }

        if let Err(e) = write_saved(&self.path, &state.saved) {
            tracing::warn!(path = ?self.path, "Failed to persist session cookies: {}", e);
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.state.read().ok()?.jar.cookies(url)
    }
}

fn cookie_name(set_cookie: &str) -> Option<&str> {
    let (name, _) = set_cookie.split(';').next()?.split_once('=')?;
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

fn write_saved(path: &Path, saved: &[SavedCookie]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(saved)?;
    std::fs::write(path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
