//! Error types for the core library.

use std::sync::Arc;

use thiserror::Error;

use crate::vault::SecretError;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The stored key material does not unlock the account's keys.
    #[error("Failed to unlock account: {0}")]
    Unlock(String),

    /// A binding, address or account lookup missed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The account or binding is already registered.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Authentication failed. Never says whether the secret or the email was wrong.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Configuration could not be loaded, validated or persisted.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Secret storage error.
    #[error("Secret storage error: {0}")]
    Secret(#[from] SecretError),

    /// The remote API returned an error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Protocol-server provisioning or deprovisioning failed.
    #[error("Provisioning error: {0}")]
    Provision(String),

    /// No protocol server instance is attached.
    #[error("No protocol server instance running")]
    NoProtocolServer,

    /// A running sync was cancelled.
    #[error("Sync aborted")]
    SyncAborted,

    /// Sync failed for a reason other than cancellation.
    #[error("Sync error: {0}")]
    Sync(String),

    /// The handle was already closed.
    #[error("Handle is closed")]
    Closed,

    /// An error shared with a lifecycle event.
    #[error(transparent)]
    Shared(Arc<Error>),
}

impl Error {
    /// Stable name of the error variant, used to classify failures in reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unlock(_) => "Unlock",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::InvalidCredentials => "InvalidCredentials",
            Self::Config(_) => "Config",
            Self::Database(_) => "Database",
            Self::Serde(_) => "Serde",
            Self::Io(_) => "Io",
            Self::Secret(_) => "Secret",
            Self::Remote(_) => "Remote",
            Self::Provision(_) => "Provision",
            Self::NoProtocolServer => "NoProtocolServer",
            Self::SyncAborted => "SyncAborted",
            Self::Sync(_) => "Sync",
            Self::Closed => "Closed",
            Self::Shared(inner) => inner.kind(),
        }
    }

    /// Returns true for lookup misses.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_variant() {
        assert_eq!(Error::InvalidCredentials.kind(), "InvalidCredentials");
        assert_eq!(Error::NotFound("x".into()).kind(), "NotFound");
        assert_eq!(Error::Remote("boom".into()).kind(), "Remote");
    }

    #[test]
    fn invalid_credentials_message_is_opaque() {
        assert_eq!(Error::InvalidCredentials.to_string(), "Invalid credentials");
    }

    #[test]
    fn shared_error_keeps_kind() {
        let shared = Error::Shared(Arc::new(Error::NotFound("gone".into())));
        assert_eq!(shared.kind(), "NotFound");
        assert!(shared.is_not_found());
        assert_eq!(shared.to_string(), "Not found: gone");
    }

    #[test]
    fn not_found_predicate() {
        assert!(Error::NotFound("addr".into()).is_not_found());
        assert!(!Error::Closed.is_not_found());
    }
}
