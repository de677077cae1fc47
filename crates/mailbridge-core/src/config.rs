//! Bridge configuration.
//!
//! Stored as pretty-printed JSON. A missing file means defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::account::{AddressMode, UserId};
use crate::remote::Credential;
use crate::vault::{KeyringSecretStore, MemorySecretStore, NewUser, SecretStore, VaultStore};
use crate::{Error, Result, logging};

/// Where account secrets are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretBackend {
    /// The platform keyring.
    #[default]
    Keyring,
    /// Process memory only. Secrets are lost on exit.
    Memory,
}

/// Configuration of the whole bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// `SQLite` file holding the vaults.
    pub database_path: PathBuf,
    /// Base polling period of the remote event stream, in seconds.
    pub event_period_secs: u64,
    /// Random jitter added to each poll, in seconds.
    pub event_jitter_secs: u64,
    /// Messages fetched per resync page.
    pub sync_page_size: usize,
    /// Address mode given to newly added accounts.
    pub default_address_mode: AddressMode,
    /// Secret storage backend.
    pub secret_backend: SecretBackend,
    /// Fallback `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            database_path: data_dir().join("vault.db"),
            event_period_secs: 20,
            event_jitter_secs: 20,
            sync_page_size: 150,
            default_address_mode: AddressMode::Combined,
            secret_backend: SecretBackend::Keyring,
            log_filter: "mailbridge_core=info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mailbridge")
            .join("config.json")
    }

    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read, parsed, or is invalid.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self::default());
        }
        Self::load(path).await
    }

    /// Write the configuration, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or cannot be written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;

        info!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Check values that would make the bridge unusable.
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("database_path must not be empty".into()));
        }
        if self.sync_page_size == 0 {
            return Err(Error::Config("sync_page_size must be positive".into()));
        }
        Ok(())
    }

    /// Secret store selected by `secret_backend`.
    #[must_use]
    pub fn secret_store(&self) -> Arc<dyn SecretStore> {
        match self.secret_backend {
            SecretBackend::Keyring => Arc::new(KeyringSecretStore),
            SecretBackend::Memory => Arc::new(MemorySecretStore::new()),
        }
    }

    /// Open the vault database at `database_path`, creating its directory.
    ///
    /// # Errors
    ///
    /// Returns `Config` for a non UTF-8 path, or the I/O or database error.
    pub async fn open_vault_store(&self) -> Result<VaultStore> {
        let path = self
            .database_path
            .to_str()
            .ok_or_else(|| Error::Config("database_path must be valid UTF-8".into()))?;

        if let Some(dir) = self.database_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        VaultStore::new(path, self.secret_store()).await
    }

    /// Vault registration for a freshly logged-in account, in the default address mode.
    #[must_use]
    pub fn new_user(
        &self,
        user_id: UserId,
        key_passphrase: Vec<u8>,
        credential: Credential,
    ) -> NewUser {
        NewUser {
            user_id,
            key_passphrase,
            credential,
            address_mode: self.default_address_mode,
        }
    }

    /// Install the global subscriber with `log_filter` as the fallback filter.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a subscriber is already installed.
    pub fn init_logging(&self) -> Result<()> {
        logging::init(&self.log_filter)
    }

    /// Per-session settings derived from this configuration.
    #[must_use]
    pub const fn session_config(&self) -> SessionConfig {
        SessionConfig {
            event_period: Duration::from_secs(self.event_period_secs),
            event_jitter: Duration::from_secs(self.event_jitter_secs),
            sync_page_size: self.sync_page_size,
        }
    }
}

/// Settings handed to every `UserSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Base polling period of the remote event stream.
    pub event_period: Duration,
    /// Random jitter added to each poll.
    pub event_jitter: Duration,
    /// Messages fetched per resync page.
    pub sync_page_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        BridgeConfig::default().session_config()
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailbridge")
}
