//! Leadflow - session-aware client for the lead-management dashboard API
//!
//! This library provides the client-side auth session lifecycle (login,
//! silent refresh, auto-login, logout), a route guard driven by that
//! session, and a leads client built on top of it.

pub mod auth;
pub mod config;
pub mod error;
pub mod guard;
pub mod http;
pub mod leads;
pub mod session;
pub mod ui;

pub use error::{Error, Result};
pub use session::{AuthOutcome, Session, SessionManager, SessionState};
