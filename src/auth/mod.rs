//! Authentication module for credential storage and Google sign-in
//!
//! This module provides:
//! - Credential pair storage (file-backed and in-memory)
//! - Google callback parsing, code exchange and loopback capture

mod store;
mod callback;

pub use store::{CredentialPair, FileTokenStore, MemoryTokenStore, TokenStore, credentials_path};
pub use callback::{CallbackParams, handle_google_callback, redirect_uri, wait_for_callback};
