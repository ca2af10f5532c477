//! Error types for Leadflow

use std::fmt;
use thiserror::Error;

/// Result type alias for Leadflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Form field a validation error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Username,
    Email,
    Password,
    Code,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Username => "username",
            Field::Email => "email",
            Field::Password => "password",
            Field::Code => "code",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in Leadflow
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Network error: {0}")]
    Network(String),

    /// Non-2xx response other than an unrecoverable 401
    #[error("API error ({status}): {detail}")]
    Api { status: u16, detail: String },

    /// 401 that survived the silent refresh step.
    ///
    /// `session_expired` is set when the backend rejected the refresh
    /// credential itself, i.e. the session cannot be recovered.
    #[error("Unauthorized: {detail}")]
    Unauthorized { detail: String, session_expired: bool },

    #[error("{message}")]
    Validation { field: Field, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a validation error for a form field.
    pub fn validation(field: Field, message: impl Into<String>) -> Self {
        Error::Validation {
            field,
            message: message.into(),
        }
    }

    /// Message supplied by the backend or by input validation.
    ///
    /// Transport and parse failures return `None` so callers fall back to
    /// their own generic wording.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Error::Api { detail, .. } | Error::Unauthorized { detail, .. } => Some(detail),
            Error::Validation { message, .. } => Some(message),
            _ => None,
        }
    }

    /// True when the session behind this error can no longer be refreshed.
    pub fn is_session_expired(&self) -> bool {
        matches!(
            self,
            Error::Unauthorized {
                session_expired: true,
                ..
            }
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
