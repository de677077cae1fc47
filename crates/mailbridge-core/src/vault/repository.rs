//! `SQLite`-backed vault storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use rand::RngCore;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, warn};

use super::secrets::{SecretKind, SecretStore};
use super::{SyncCheckpoint, Vault};
use crate::account::{AddressId, AddressMode, UserId};
use crate::remote::{Credential, Cursor, MessageId};
use crate::server::BindingToken;
use crate::{Error, Result};

/// Length of generated bridge passwords, in bytes.
const BRIDGE_PASSWORD_LEN: usize = 16;

/// Length of generated protocol-server encryption keys, in bytes.
const ENCRYPTION_KEY_LEN: usize = 32;

/// Everything needed to register a freshly logged-in account.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Remote account ID.
    pub user_id: UserId,
    /// Passphrase unlocking the account keys.
    pub key_passphrase: Vec<u8>,
    /// Remote session credential.
    pub credential: Credential,
    /// Initial address mode.
    pub address_mode: AddressMode,
}

/// Storage for every account's vault.
#[derive(Debug, Clone)]
pub struct VaultStore {
    pool: SqlitePool,
    secrets: Arc<dyn SecretStore>,
}

impl VaultStore {
    /// Open the store at the given database path.
    ///
    /// Creates the database and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str, secrets: Arc<dyn SecretStore>) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool, secrets };
        store.initialize().await?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory(secrets: Arc<dyn SecretStore>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool, secrets };
        store.initialize().await?;
        Ok(store)
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS vault_users (
                user_id TEXT PRIMARY KEY,
                address_mode TEXT NOT NULL,
                event_cursor TEXT,
                has_labels INTEGER NOT NULL DEFAULT 0,
                has_messages INTEGER NOT NULL DEFAULT 0,
                last_message_id TEXT,
                encryption_key BLOB NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS vault_bindings (
                user_id TEXT NOT NULL,
                address_id TEXT NOT NULL,
                binding TEXT NOT NULL,
                PRIMARY KEY (user_id, address_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// IDs of every stored account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn user_ids(&self) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT user_id FROM vault_users ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| UserId::new(row.get::<String, _>("user_id")))
            .collect())
    }

    /// Register a new account and open its vault.
    ///
    /// Generates the bridge password and the protocol-server encryption key.
    ///
    /// # Errors
    ///
    /// Returns an error if the account already exists, or storage fails.
    pub async fn create_user(&self, new_user: NewUser) -> Result<SqliteVault> {
        let mut encryption_key = vec![0u8; ENCRYPTION_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut encryption_key);

        let mut bridge_password = vec![0u8; BRIDGE_PASSWORD_LEN];
        rand::thread_rng().fill_bytes(&mut bridge_password);

        sqlx::query(
            r"
            INSERT INTO vault_users (user_id, address_mode, encryption_key)
            VALUES (?, ?, ?)
            ",
        )
        .bind(new_user.user_id.as_str())
        .bind(new_user.address_mode.as_str())
        .bind(&encryption_key)
        .execute(&self.pool)
        .await?;

        let user_id = &new_user.user_id;
        self.secrets
            .set(user_id, SecretKind::BridgePassword, &bridge_password)?;
        self.secrets
            .set(user_id, SecretKind::KeyPassphrase, &new_user.key_passphrase)?;
        self.secrets.set(
            user_id,
            SecretKind::Credential,
            &serde_json::to_vec(&new_user.credential)?,
        )?;

        debug!("Created vault for account {user_id}");
        self.open_user(user_id).await
    }

    /// Open an existing account's vault.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is unknown, or an error if storage fails.
    pub async fn open_user(&self, user_id: &UserId) -> Result<SqliteVault> {
        let row = sqlx::query(
            r"
            SELECT address_mode, event_cursor, has_labels, has_messages,
                   last_message_id, encryption_key
            FROM vault_users
            WHERE user_id = ?
            ",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("vault for account {user_id}")))?;

        let binding_rows =
            sqlx::query("SELECT address_id, binding FROM vault_bindings WHERE user_id = ?")
                .bind(user_id.as_str())
                .fetch_all(&self.pool)
                .await?;

        let bindings = binding_rows
            .iter()
            .map(|row| {
                (
                    AddressId::new(row.get::<String, _>("address_id")),
                    BindingToken::new(row.get::<String, _>("binding")),
                )
            })
            .collect();

        let state = CachedState {
            address_mode: AddressMode::from_str_lossy(row.get("address_mode")),
            event_cursor: row.get::<Option<String>, _>("event_cursor").map(Cursor::new),
            checkpoint: SyncCheckpoint {
                has_labels: row.get::<i64, _>("has_labels") != 0,
                has_messages: row.get::<i64, _>("has_messages") != 0,
                last_message_id: row
                    .get::<Option<String>, _>("last_message_id")
                    .map(MessageId::new),
            },
            bindings,
            encryption_key: row.get("encryption_key"),
            bridge_secret: self.secrets.require(user_id, SecretKind::BridgePassword)?,
            key_passphrase: self.secrets.require(user_id, SecretKind::KeyPassphrase)?,
        };

        Ok(SqliteVault {
            pool: self.pool.clone(),
            secrets: Arc::clone(&self.secrets),
            user_id: user_id.clone(),
            state: RwLock::new(state),
            closed: AtomicBool::new(false),
        })
    }
}

#[derive(Debug, Default)]
struct CachedState {
    address_mode: AddressMode,
    event_cursor: Option<Cursor>,
    checkpoint: SyncCheckpoint,
    bindings: HashMap<AddressId, BindingToken>,
    encryption_key: Vec<u8>,
    bridge_secret: Vec<u8>,
    key_passphrase: Vec<u8>,
}

/// One account's vault, cached in memory and written through to `SQLite`.
#[derive(Debug)]
pub struct SqliteVault {
    pool: SqlitePool,
    secrets: Arc<dyn SecretStore>,
    user_id: UserId,
    state: RwLock<CachedState>,
    closed: AtomicBool,
}

impl SqliteVault {
    /// Account this vault belongs to.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn read<T>(&self, f: impl FnOnce(&CachedState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write(&self, f: impl FnOnce(&mut CachedState)) {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner));
    }

    async fn store_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        self.ensure_open()?;
        sqlx::query(
            r"
            UPDATE vault_users
            SET has_labels = ?, has_messages = ?, last_message_id = ?, updated_at = ?
            WHERE user_id = ?
            ",
        )
        .bind(checkpoint.has_labels)
        .bind(checkpoint.has_messages)
        .bind(checkpoint.last_message_id.as_ref().map(MessageId::as_str))
        .bind(now())
        .bind(self.user_id.as_str())
        .execute(&self.pool)
        .await?;

        let checkpoint = checkpoint.clone();
        self.write(|state| state.checkpoint = checkpoint);
        Ok(())
    }
}

#[async_trait]
impl Vault for SqliteVault {
    fn address_mode(&self) -> AddressMode {
        self.read(|state| state.address_mode)
    }

    async fn set_address_mode(&self, mode: AddressMode) -> Result<()> {
        self.ensure_open()?;
        sqlx::query("UPDATE vault_users SET address_mode = ?, updated_at = ? WHERE user_id = ?")
            .bind(mode.as_str())
            .bind(now())
            .bind(self.user_id.as_str())
            .execute(&self.pool)
            .await?;

        self.write(|state| state.address_mode = mode);
        Ok(())
    }

    fn event_cursor(&self) -> Option<Cursor> {
        self.read(|state| state.event_cursor.clone())
    }

    async fn set_event_cursor(&self, cursor: &Cursor) -> Result<()> {
        self.ensure_open()?;
        sqlx::query("UPDATE vault_users SET event_cursor = ?, updated_at = ? WHERE user_id = ?")
            .bind(cursor.as_str())
            .bind(now())
            .bind(self.user_id.as_str())
            .execute(&self.pool)
            .await?;

        let cursor = cursor.clone();
        self.write(|state| state.event_cursor = Some(cursor));
        Ok(())
    }

    fn bindings(&self) -> HashMap<AddressId, BindingToken> {
        self.read(|state| state.bindings.clone())
    }

    async fn set_binding(&self, address_id: &AddressId, binding: &BindingToken) -> Result<()> {
        self.ensure_open()?;
        sqlx::query(
            r"
            INSERT INTO vault_bindings (user_id, address_id, binding) VALUES (?, ?, ?)
            ON CONFLICT (user_id, address_id) DO UPDATE SET binding = excluded.binding
            ",
        )
        .bind(self.user_id.as_str())
        .bind(address_id.as_str())
        .bind(binding.as_str())
        .execute(&self.pool)
        .await?;

        let (address_id, binding) = (address_id.clone(), binding.clone());
        self.write(|state| {
            state.bindings.insert(address_id, binding);
        });
        Ok(())
    }

    async fn remove_binding(&self, address_id: &AddressId) -> Result<()> {
        self.ensure_open()?;
        sqlx::query("DELETE FROM vault_bindings WHERE user_id = ? AND address_id = ?")
            .bind(self.user_id.as_str())
            .bind(address_id.as_str())
            .execute(&self.pool)
            .await?;

        self.write(|state| {
            state.bindings.remove(address_id);
        });
        Ok(())
    }

    fn sync_checkpoint(&self) -> SyncCheckpoint {
        self.read(|state| state.checkpoint.clone())
    }

    async fn set_sync_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        self.store_checkpoint(checkpoint).await
    }

    async fn clear_sync_checkpoint(&self) -> Result<()> {
        self.store_checkpoint(&SyncCheckpoint::default()).await
    }

    fn bridge_secret(&self) -> Vec<u8> {
        self.read(|state| state.bridge_secret.clone())
    }

    fn key_passphrase(&self) -> Vec<u8> {
        self.read(|state| state.key_passphrase.clone())
    }

    fn encryption_key(&self) -> Vec<u8> {
        self.read(|state| state.encryption_key.clone())
    }

    async fn set_credential(&self, credential: &Credential) -> Result<()> {
        self.ensure_open()?;
        self.secrets.set(
            &self.user_id,
            SecretKind::Credential,
            &serde_json::to_vec(credential)?,
        )?;
        debug!("Stored renewed credential for account {}", self.user_id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        sqlx::query("DELETE FROM vault_bindings WHERE user_id = ?")
            .bind(self.user_id.as_str())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM vault_users WHERE user_id = ?")
            .bind(self.user_id.as_str())
            .execute(&self.pool)
            .await?;

        if let Err(e) = self.secrets.delete_all(&self.user_id) {
            warn!("Failed to delete secrets of account {}: {e}", self.user_id);
            return Err(e.into());
        }

        self.write(|state| *state = CachedState::default());
        debug!("Cleared vault for account {}", self.user_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closed vault for account {}", self.user_id);
        }
        Ok(())
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}
