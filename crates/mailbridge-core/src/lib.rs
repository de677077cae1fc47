//! # mailbridge-core
//!
//! Per-account session coordination for a mail bridge that exposes a remote
//! mailbox provider's accounts through a local IMAP/SMTP server.
//!
//! This crate provides:
//! - **Sessions** - one actor per account keeping the local mailbox view in
//!   step with the remote event stream
//! - **Resync** - single-flight, cancellable, resumable full synchronization
//! - **Address modes** - combined or split mapping of addresses to mailboxes,
//!   switchable while the account is live
//! - **Fleet dispatch** - provisioning, repair and forced logout driven by
//!   session lifecycle events
//! - **Vault** - per-account state in `SQLite`, secrets in the system keyring
//!
//! The remote API client and the protocol server are collaborators reached
//! through the [`RemoteClient`] and [`ProtocolServer`] traits.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod account;
pub mod bridge;
pub mod config;
mod error;
pub mod logging;
pub mod remote;
pub mod server;
pub mod session;
pub mod vault;

pub use account::{AccountIdentity, Address, AddressDirectory, AddressId, AddressMode, UserId};
pub use bridge::{AccountNotice, AccountRegistry, ReportContext, Reporter, TracingReporter};
pub use config::{BridgeConfig, SecretBackend, SessionConfig};
pub use error::{Error, Result};
pub use remote::{Credential, Cursor, RemoteClient, RemoteEvent};
pub use server::{BindingToken, ProtocolServer};
pub use session::{
    Connector, MailboxUpdate, SessionEvent, SmtpSession, SyncOutcome, UserSession,
};
pub use vault::{KeyringSecretStore, MemorySecretStore, SecretStore, SqliteVault, Vault, VaultStore};
