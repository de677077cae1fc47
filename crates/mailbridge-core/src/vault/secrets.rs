//! Secret storage for account secrets.
//!
//! Secrets never touch the `SQLite` file. The default backend is the
//! platform's native credential storage:
//! - Linux: Secret Service (GNOME Keyring, `KWallet`)
//! - macOS: Keychain
//! - Windows: Credential Manager

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use keyring::Entry;
use tracing::{debug, warn};

use crate::account::UserId;

/// Service name used for keyring entries.
const SERVICE_NAME: &str = "mailbridge";

/// Kinds of secret kept per account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKind {
    /// Password mail clients use against the bridge.
    BridgePassword,
    /// Passphrase unlocking the account keys.
    KeyPassphrase,
    /// Remote session credential, JSON encoded.
    Credential,
}

impl SecretKind {
    /// Every kind, for bulk deletion.
    pub const ALL: [Self; 3] = [Self::BridgePassword, Self::KeyPassphrase, Self::Credential];

    const fn as_str(self) -> &'static str {
        match self {
            Self::BridgePassword => "bridge_password",
            Self::KeyPassphrase => "key_passphrase",
            Self::Credential => "credential",
        }
    }
}

/// Error type for secret operations.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// Failed to access keyring.
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    /// A required secret is missing.
    #[error("Missing {0:?} secret for account {1}")]
    Missing(SecretKind, UserId),
}

/// Result type for secret operations.
pub type SecretResult<T> = std::result::Result<T, SecretError>;

/// Generates the entry key for a secret.
fn secret_key(user_id: &UserId, kind: SecretKind) -> String {
    format!("{SERVICE_NAME}_{}_{user_id}", kind.as_str())
}

/// Backend holding account secrets.
pub trait SecretStore: Send + Sync + std::fmt::Debug {
    /// Read a secret, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn get(&self, user_id: &UserId, kind: SecretKind) -> SecretResult<Option<Vec<u8>>>;

    /// Store a secret, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn set(&self, user_id: &UserId, kind: SecretKind, secret: &[u8]) -> SecretResult<()>;

    /// Delete a secret. Deleting a missing secret succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn delete(&self, user_id: &UserId, kind: SecretKind) -> SecretResult<()>;

    /// Read a secret that must exist.
    ///
    /// # Errors
    ///
    /// Returns `Missing` if absent, or the backend error.
    fn require(&self, user_id: &UserId, kind: SecretKind) -> SecretResult<Vec<u8>> {
        self.get(user_id, kind)?
            .ok_or_else(|| SecretError::Missing(kind, user_id.clone()))
    }

    /// Delete every secret of an account.
    ///
    /// # Errors
    ///
    /// Returns the first backend error; later kinds are still attempted.
    fn delete_all(&self, user_id: &UserId) -> SecretResult<()> {
        let mut first_err = None;
        for kind in SecretKind::ALL {
            if let Err(e) = self.delete(user_id, kind) {
                warn!("Failed to delete {kind:?} for account {user_id}: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Secrets in the system keyring.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringSecretStore;

impl SecretStore for KeyringSecretStore {
    fn get(&self, user_id: &UserId, kind: SecretKind) -> SecretResult<Option<Vec<u8>>> {
        let entry = Entry::new(SERVICE_NAME, &secret_key(user_id, kind))?;
        match entry.get_secret() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => {
                debug!("No {kind:?} found for account {user_id}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, user_id: &UserId, kind: SecretKind, secret: &[u8]) -> SecretResult<()> {
        let entry = Entry::new(SERVICE_NAME, &secret_key(user_id, kind))?;
        entry.set_secret(secret)?;
        debug!("Stored {kind:?} for account {user_id}");
        Ok(())
    }

    fn delete(&self, user_id: &UserId, kind: SecretKind) -> SecretResult<()> {
        let entry = Entry::new(SERVICE_NAME, &secret_key(user_id, kind))?;
        match entry.delete_credential() {
            Ok(()) => {
                debug!("Deleted {kind:?} for account {user_id}");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => {
                debug!("No {kind:?} to delete for account {user_id}");
                Ok(())
            }
            Err(e) => {
                warn!("Failed to delete {kind:?}: {e}");
                Err(e.into())
            }
        }
    }
}

/// Process-local secrets, lost on exit.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, user_id: &UserId, kind: SecretKind) -> SecretResult<Option<Vec<u8>>> {
        Ok(self
            .secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&secret_key(user_id, kind))
            .cloned())
    }

    fn set(&self, user_id: &UserId, kind: SecretKind, secret: &[u8]) -> SecretResult<()> {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(secret_key(user_id, kind), secret.to_vec());
        Ok(())
    }

    fn delete(&self, user_id: &UserId, kind: SecretKind) -> SecretResult<()> {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&secret_key(user_id, kind));
        Ok(())
    }
}
