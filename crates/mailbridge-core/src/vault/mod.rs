//! Persistent per-account state ("vault").
//!
//! Non-secret state (address mode, event cursor, bindings, sync checkpoint,
//! encryption key) is stored in `SQLite`; secrets are kept in a
//! [`SecretStore`], by default the system keyring.

mod repository;
mod secrets;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use repository::{NewUser, SqliteVault, VaultStore};
pub use secrets::{
    KeyringSecretStore, MemorySecretStore, SecretError, SecretKind, SecretResult, SecretStore,
};

use crate::Result;
use crate::account::{AddressId, AddressMode};
use crate::remote::{Credential, Cursor, MessageId};
use crate::server::BindingToken;

/// Resumable progress of the resync procedure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    /// Labels have been pushed to every sink.
    pub has_labels: bool,
    /// Every message page has been pushed.
    pub has_messages: bool,
    /// Last message pushed, to resume paging after.
    pub last_message_id: Option<MessageId>,
}

impl SyncCheckpoint {
    /// Whether the resync has nothing left to do.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.has_labels && self.has_messages
    }
}

/// Per-account persistent state.
///
/// Getters read cached state and never fail; setters write through.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Persisted address mode.
    fn address_mode(&self) -> AddressMode;

    /// Persist the address mode.
    async fn set_address_mode(&self, mode: AddressMode) -> Result<()>;

    /// Cursor of the last applied remote event.
    fn event_cursor(&self) -> Option<Cursor>;

    /// Persist the cursor of the last applied remote event.
    async fn set_event_cursor(&self, cursor: &Cursor) -> Result<()>;

    /// Persisted protocol-server bindings.
    fn bindings(&self) -> HashMap<AddressId, BindingToken>;

    /// Persist a binding.
    async fn set_binding(&self, address_id: &AddressId, binding: &BindingToken) -> Result<()>;

    /// Remove a binding.
    async fn remove_binding(&self, address_id: &AddressId) -> Result<()>;

    /// Resync progress.
    fn sync_checkpoint(&self) -> SyncCheckpoint;

    /// Persist resync progress.
    async fn set_sync_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()>;

    /// Forget all resync progress.
    async fn clear_sync_checkpoint(&self) -> Result<()>;

    /// Password mail clients use to authenticate against the bridge.
    fn bridge_secret(&self) -> Vec<u8>;

    /// Passphrase that unlocks the account keys.
    fn key_passphrase(&self) -> Vec<u8>;

    /// Key used by the protocol server to encrypt its local store.
    fn encryption_key(&self) -> Vec<u8>;

    /// Persist a renewed remote credential.
    async fn set_credential(&self, credential: &Credential) -> Result<()>;

    /// Delete everything stored for this account.
    async fn clear(&self) -> Result<()>;

    /// Release the handle.
    async fn close(&self) -> Result<()>;
}
