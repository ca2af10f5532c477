//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use crate::Result;
use crate::error::Error;

/// Environment variable overriding `base_url`
pub const BASE_URL_ENV: &str = "LEADFLOW_BASE_URL";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// How credentials travel to the backend ("token" or "cookie")
    #[serde(default)]
    pub auth_mode: AuthMode,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Google sign-in settings
    #[serde(default)]
    pub google: GoogleConfig,
}

/// Credential mechanism for a deployment.
///
/// Exactly one is active: bearer tokens kept in the local token store, or
/// httpOnly cookies kept in the HTTP client's cookie jar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Token,
    Cookie,
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Token => f.write_str("token"),
            AuthMode::Cookie => f.write_str("cookie"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleConfig {
    /// Loopback port the Google callback is delivered to
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,

    /// Open the system browser automatically
    #[serde(default = "default_true")]
    pub open_browser: bool,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            callback_port: default_callback_port(),
            open_browser: true,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_callback_port() -> u16 {
    3000
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_mode: AuthMode::default(),
            timeout_secs: default_timeout_secs(),
            google: GoogleConfig::default(),
        }
    }
}

impl Config {
    /// Request timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Backend-hosted entry point of the Google sign-in flow
    pub fn google_login_url(&self) -> String {
        format!("{}/oauth/google/login", self.base_url.trim_end_matches('/'))
    }

    fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            if !url.trim().is_empty() {
                self.base_url = url.trim().to_string();
            }
        }
        self
    }

    fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("Invalid base_url {:?}: {}", self.base_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "base_url must be http or https, got {}",
                url.scheme()
            )));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".leadflow")
}

/// Get the config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration from file
pub fn load() -> Result<Config> {
    let path = config_path();

    if !path.exists() {
        return Err(Error::Config(format!(
            "Config not found at {:?}. Run 'leadflow init' first.",
            path
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let config: Config = serde_json::from_str(&content)?;
    let config = config.apply_env();
    config.validate()?;
    Ok(config)
}

/// Load configuration, falling back to defaults when no file exists
pub fn load_or_default() -> Result<Config> {
    if config_path().exists() {
        return load();
    }
    let config = Config::default().apply_env();
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save(config: &Config) -> Result<()> {
    config.validate()?;
    let path = config_path();

    // Create parent directory
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    Ok(())
}

/// Interactive setup wizard
pub fn onboard() -> Result<()> {
    use crate::ui;
    use inquire::{Confirm, CustomType, Select, Text};

    ui::print_header("Setup", "");
    println!("  Point Leadflow at your dashboard backend.\n");

    let mut config = Config::default();

    // 1. Backend
    let default_url = config.base_url.clone();
    config.base_url = Text::new("Backend URL:")
        .with_default(&default_url)
        .prompt()
        .map_err(|e| Error::Config(format!("Prompt failed: {}", e)))?;

    // 2. Credential mechanism
    let modes = vec![
        "Bearer tokens (stored in ~/.leadflow/credentials.json)",
        "Session cookies (set by the backend)",
    ];
    let mode_choice = Select::new("How does the backend authenticate requests?", modes)
        .prompt()
        .map_err(|e| Error::Config(format!("Prompt failed: {}", e)))?;
    config.auth_mode = if mode_choice.starts_with("Session cookies") {
        AuthMode::Cookie
    } else {
        AuthMode::Token
    };

    // 3. Google callback
    let custom_port = Confirm::new(&format!(
        "Receive Google sign-in callbacks on port {}?",
        config.google.callback_port
    ))
    .with_default(true)
    .prompt()
    .map_err(|e| Error::Config(format!("Prompt failed: {}", e)))?;

    if !custom_port {
        config.google.callback_port = CustomType::<u16>::new("Callback port:")
            .prompt()
            .map_err(|e| Error::Config(format!("Prompt failed: {}", e)))?;
    }

    ui::print_thinking("Saving configuration");
    save(&config)?;

    println!();
    ui::print_success("Setup complete!");
    ui::print_step("Run 'leadflow login' to sign in.");

    Ok(())
}
