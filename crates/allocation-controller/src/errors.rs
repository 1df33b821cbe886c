//! Allocation controller error types.
//!
//! Startup concerns carry their own error types ([`crate::config::ConfigError`],
//! [`crate::catalog::CatalogError`]); `AllocError` covers the runtime paths.
//! Internal details are logged server-side but never forwarded to claimants;
//! `client_message()` produces the safe rendition.

use thiserror::Error;

/// Runtime error type for the allocation controller.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The claimant has no live connection. Recoverable: the claimant is
    /// simply offline, the caller drops the message.
    #[error("Claimant not connected")]
    NotConnected,

    /// An actor mailbox or response channel failed.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AllocError {
    /// Returns a client-safe message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            AllocError::Internal(_) => "An internal error occurred".to_string(),
            AllocError::NotConnected => "Claimant is not connected".to_string(),
        }
    }
}
