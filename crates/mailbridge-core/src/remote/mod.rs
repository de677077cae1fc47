//! Contract of the remote mail API client.
//!
//! The wire protocol lives outside this crate. The session only needs an
//! address directory, key unlocking, a cursor-based event stream, paged
//! label/message listings for resync, and session revocation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Result;
use crate::account::{AccountIdentity, Address, AddressId, string_id};

string_id! {
    /// Position in the remote event stream.
    Cursor
}

string_id! {
    /// Remote identifier of a label (exposed as a mailbox).
    LabelId
}

string_id! {
    /// Remote identifier of a message.
    MessageId
}

/// Session credential issued by the remote API, rotated on renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Session UID.
    pub uid: String,
    /// Refresh token for the next run.
    pub refresh_token: String,
}

/// A remote label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Label ID.
    pub id: LabelId,
    /// Display name, hierarchy separated by `/`.
    pub name: String,
}

/// Message metadata as listed by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Message ID.
    pub id: MessageId,
    /// Address the message belongs to.
    pub address_id: AddressId,
    /// Labels applied to the message.
    pub label_ids: Vec<LabelId>,
    /// Whether the message is unread.
    pub unread: bool,
}

/// Address change carried by a remote event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressEvent {
    /// Address was added to the account.
    Created(Address),
    /// Address attributes changed.
    Updated(Address),
    /// Address was removed.
    Deleted(AddressId),
}

/// Label change carried by a remote event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelEvent {
    /// Label was created.
    Created(Label),
    /// Label was renamed.
    Updated(Label),
    /// Label was deleted.
    Deleted(LabelId),
}

/// Message change carried by a remote event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageEvent {
    /// New message.
    Created(MessageMeta),
    /// Labels or read state changed.
    Updated(MessageMeta),
    /// Message was deleted.
    Deleted(MessageId),
}

/// One delivery of the remote event stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteEvent {
    /// Cursor to persist once this event has been applied.
    pub cursor: Cursor,
    /// The remote state changed too much to diff; everything must be refetched.
    pub refresh: bool,
    /// New account snapshot, if it changed.
    pub user: Option<AccountIdentity>,
    /// Address changes, in order.
    pub addresses: Vec<AddressEvent>,
    /// Label changes, in order.
    pub labels: Vec<LabelEvent>,
    /// Message changes, in order.
    pub messages: Vec<MessageEvent>,
}

impl Default for Cursor {
    fn default() -> Self {
        Self(String::new())
    }
}

/// Sequential source of remote events. Transport failures arrive as `Err` items.
pub type EventStream = mpsc::Receiver<Result<RemoteEvent>>;

/// Callback invoked with each renewed credential.
pub type CredentialHandler = Box<dyn Fn(Credential) + Send + Sync>;

/// Callback invoked when the remote side invalidates the session.
pub type DeauthHandler = Box<dyn Fn() + Send + Sync>;

/// An authenticated client of the remote mail API.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch the current account snapshot.
    async fn fetch_user(&self) -> Result<AccountIdentity>;

    /// Fetch the account's addresses.
    async fn fetch_addresses(&self) -> Result<Vec<Address>>;

    /// Check that the key passphrase unlocks the account and address keys.
    fn unlock(&self, user: &AccountIdentity, addrs: &[Address], key_passphrase: &[u8])
    -> Result<()>;

    /// Cursor of the newest event.
    async fn latest_event_cursor(&self) -> Result<Cursor>;

    /// Start streaming events after `from`, polling with the given period and jitter.
    fn event_stream(&self, period: Duration, jitter: Duration, from: Cursor) -> EventStream;

    /// Register a handler for renewed credentials.
    fn on_credential_renewed(&self, handler: CredentialHandler);

    /// Register a handler for remote deauthorization.
    fn on_deauthorized(&self, handler: DeauthHandler);

    /// Fetch every label.
    async fn fetch_labels(&self) -> Result<Vec<Label>>;

    /// Fetch up to `limit` messages whose ID sorts after `after`.
    async fn fetch_messages(
        &self,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<MessageMeta>>;

    /// Revoke the remote session.
    async fn revoke_session(&self) -> Result<()>;

    /// Release the client. Ends any running event stream.
    async fn close(&self) -> Result<()>;
}
