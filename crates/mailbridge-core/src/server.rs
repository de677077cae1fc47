//! Contract of the local IMAP/SMTP protocol server.
//!
//! The server keeps one registration per exposed mailbox namespace. A
//! registration is identified by an opaque [`BindingToken`] that the session
//! persists so it can be re-attached on the next start.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::account::string_id;
use crate::session::Connector;

string_id! {
    /// Server-assigned token of a protocol-server registration.
    BindingToken
}

/// The protocol server the bridge exposes accounts through.
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    /// Register a new namespace backed by `connector`.
    ///
    /// `encryption_key` protects the server's local store for this namespace.
    async fn provision(&self, connector: Connector, encryption_key: &[u8]) -> Result<BindingToken>;

    /// Re-attach an existing registration to a fresh connector.
    ///
    /// Fails with `NotFound` if the server no longer knows the binding.
    async fn load(
        &self,
        connector: Connector,
        binding: &BindingToken,
        encryption_key: &[u8],
    ) -> Result<()>;

    /// Drop a registration. With `remove_data` the server also deletes its local store.
    ///
    /// Fails with `NotFound` if the binding is unknown.
    async fn deprovision(&self, binding: &BindingToken, remove_data: bool) -> Result<()>;
}
