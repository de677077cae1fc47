//! Shared fakes for the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use mailbridge_core::bridge::{ReportContext, Reporter};
use mailbridge_core::remote::{
    CredentialHandler, DeauthHandler, EventStream, Label, LabelId, MessageId, MessageMeta,
};
use mailbridge_core::session::SessionEvent;
use mailbridge_core::vault::{MemorySecretStore, NewUser, SecretStore, SyncCheckpoint};
use mailbridge_core::{
    AccountIdentity, AccountRegistry, Address, AddressId, AddressMode, BindingToken, Connector,
    Credential, Cursor, Error, ProtocolServer, RemoteClient, RemoteEvent, Result, SessionConfig,
    UserId, UserSession, Vault, VaultStore,
};

pub const USER: &str = "user-1";

/// How long `eventually` waits before failing the test.
const PATIENCE: Duration = Duration::from_secs(5);

/// Remote client whose state and event stream are scripted by the test.
#[derive(Default)]
pub struct FakeRemote {
    pub user: Mutex<Option<AccountIdentity>>,
    pub addresses: Mutex<Vec<Address>>,
    pub labels: Mutex<Vec<Label>>,
    pub messages: Mutex<Vec<MessageMeta>>,
    pub latest_cursor: Mutex<Cursor>,
    pub reject_unlock: AtomicBool,
    pub fail_revoke: AtomicBool,
    pub fail_latest_cursor: AtomicBool,
    /// While set, `fetch_labels` signals `labels_requested` and waits for `release_labels`.
    pub hold_labels: AtomicBool,
    pub labels_requested: Notify,
    pub release_labels: Notify,
    pub revoked: AtomicUsize,
    pub closed: AtomicUsize,
    pub stream_starts: Mutex<Vec<Cursor>>,
    stream: Mutex<Option<mpsc::Sender<Result<RemoteEvent>>>>,
    credential_handler: Mutex<Option<CredentialHandler>>,
    deauth_handler: Mutex<Option<DeauthHandler>>,
}

impl FakeRemote {
    pub fn new(addresses: Vec<Address>) -> Arc<Self> {
        let remote = Self::default();
        *remote.addresses.lock().unwrap() = addresses;
        *remote.latest_cursor.lock().unwrap() = Cursor::new("c-0");
        *remote.labels.lock().unwrap() = vec![Label {
            id: LabelId::new("inbox"),
            name: "Inbox".into(),
        }];
        Arc::new(remote)
    }

    pub fn set_messages(&self, messages: Vec<MessageMeta>) {
        *self.messages.lock().unwrap() = messages;
    }

    pub fn set_latest_cursor(&self, cursor: &str) {
        *self.latest_cursor.lock().unwrap() = Cursor::new(cursor);
    }

    /// Deliver an item on the currently open event stream.
    pub async fn push(&self, item: Result<RemoteEvent>) {
        let tx = self.stream.lock().unwrap().clone().unwrap();
        tx.send(item).await.unwrap();
    }

    pub fn stream_count(&self) -> usize {
        self.stream_starts.lock().unwrap().len()
    }

    pub fn renew_credential(&self, credential: Credential) {
        let handler = self.credential_handler.lock().unwrap();
        (handler.as_ref().unwrap())(credential);
    }

    pub fn deauthorize(&self) {
        let handler = self.deauth_handler.lock().unwrap();
        (handler.as_ref().unwrap())();
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn fetch_user(&self) -> Result<AccountIdentity> {
        Ok(self.user.lock().unwrap().clone().unwrap_or_else(identity))
    }

    async fn fetch_addresses(&self) -> Result<Vec<Address>> {
        Ok(self.addresses.lock().unwrap().clone())
    }

    fn unlock(
        &self,
        _user: &AccountIdentity,
        _addrs: &[Address],
        key_passphrase: &[u8],
    ) -> Result<()> {
        if self.reject_unlock.load(Ordering::SeqCst) || key_passphrase.is_empty() {
            return Err(Error::Remote("keys do not unlock".into()));
        }
        Ok(())
    }

    async fn latest_event_cursor(&self) -> Result<Cursor> {
        if self.fail_latest_cursor.load(Ordering::SeqCst) {
            return Err(Error::Remote("cursor unavailable".into()));
        }
        Ok(self.latest_cursor.lock().unwrap().clone())
    }

    fn event_stream(&self, _period: Duration, _jitter: Duration, from: Cursor) -> EventStream {
        let (tx, rx) = mpsc::channel(16);
        *self.stream.lock().unwrap() = Some(tx);
        self.stream_starts.lock().unwrap().push(from);
        rx
    }

    fn on_credential_renewed(&self, handler: CredentialHandler) {
        *self.credential_handler.lock().unwrap() = Some(handler);
    }

    fn on_deauthorized(&self, handler: DeauthHandler) {
        *self.deauth_handler.lock().unwrap() = Some(handler);
    }

    async fn fetch_labels(&self) -> Result<Vec<Label>> {
        if self.hold_labels.load(Ordering::SeqCst) {
            self.labels_requested.notify_one();
            self.release_labels.notified().await;
        }
        Ok(self.labels.lock().unwrap().clone())
    }

    async fn fetch_messages(
        &self,
        after: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<MessageMeta>> {
        let messages = self.messages.lock().unwrap();
        Ok(messages
            .iter()
            .filter(|m| after.is_none_or(|after| m.id > *after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn revoke_session(&self) -> Result<()> {
        self.revoked.fetch_add(1, Ordering::SeqCst);
        if self.fail_revoke.load(Ordering::SeqCst) {
            return Err(Error::Remote("revoke failed".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        *self.stream.lock().unwrap() = None;
        Ok(())
    }
}

/// Protocol server that records every call.
#[derive(Default)]
pub struct RecordingServer {
    next: AtomicUsize,
    pub registrations: Mutex<HashMap<BindingToken, AddressId>>,
    pub loaded: Mutex<Vec<BindingToken>>,
    pub deprovisioned: Mutex<Vec<(BindingToken, bool)>>,
    pub connectors: Mutex<Vec<Connector>>,
}

impl RecordingServer {
    pub fn registered_addresses(&self) -> Vec<AddressId> {
        let mut ids: Vec<AddressId> =
            self.registrations.lock().unwrap().values().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ProtocolServer for RecordingServer {
    async fn provision(
        &self,
        connector: Connector,
        _encryption_key: &[u8],
    ) -> Result<BindingToken> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let binding = BindingToken::new(format!("binding-{n}"));
        self.registrations
            .lock()
            .unwrap()
            .insert(binding.clone(), connector.address_id().clone());
        self.connectors.lock().unwrap().push(connector);
        Ok(binding)
    }

    async fn load(
        &self,
        connector: Connector,
        binding: &BindingToken,
        _encryption_key: &[u8],
    ) -> Result<()> {
        match self.registrations.lock().unwrap().get_mut(binding) {
            Some(address_id) => *address_id = connector.address_id().clone(),
            None => return Err(Error::NotFound(format!("registration {binding}"))),
        }
        self.loaded.lock().unwrap().push(binding.clone());
        self.connectors.lock().unwrap().push(connector);
        Ok(())
    }

    async fn deprovision(&self, binding: &BindingToken, remove_data: bool) -> Result<()> {
        if self.registrations.lock().unwrap().remove(binding).is_none() {
            return Err(Error::NotFound(format!("registration {binding}")));
        }
        self.deprovisioned
            .lock()
            .unwrap()
            .push((binding.clone(), remove_data));
        Ok(())
    }
}

/// Reporter that keeps every report.
#[derive(Default)]
pub struct RecordingReporter {
    pub reports: Mutex<Vec<(String, ReportContext)>>,
}

impl RecordingReporter {
    pub fn messages(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|(message, _)| message.clone())
            .collect()
    }
}

impl Reporter for RecordingReporter {
    fn report_message_with_context(&self, message: &str, context: &ReportContext) -> Result<()> {
        self.reports
            .lock()
            .unwrap()
            .push((message.to_string(), context.clone()));
        Ok(())
    }
}

/// Vault whose writes can be made to fail on demand.
pub struct FlakyVault {
    inner: Arc<dyn Vault>,
    pub fail_set_mode: AtomicBool,
    pub fail_clear_checkpoint: AtomicBool,
}

impl FlakyVault {
    pub fn new(inner: Arc<dyn Vault>) -> Self {
        Self {
            inner,
            fail_set_mode: AtomicBool::new(false),
            fail_clear_checkpoint: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Vault for FlakyVault {
    fn address_mode(&self) -> AddressMode {
        self.inner.address_mode()
    }

    async fn set_address_mode(&self, mode: AddressMode) -> Result<()> {
        if self.fail_set_mode.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("disk full")));
        }
        self.inner.set_address_mode(mode).await
    }

    fn event_cursor(&self) -> Option<Cursor> {
        self.inner.event_cursor()
    }

    async fn set_event_cursor(&self, cursor: &Cursor) -> Result<()> {
        self.inner.set_event_cursor(cursor).await
    }

    fn bindings(&self) -> HashMap<AddressId, BindingToken> {
        self.inner.bindings()
    }

    async fn set_binding(&self, address_id: &AddressId, binding: &BindingToken) -> Result<()> {
        self.inner.set_binding(address_id, binding).await
    }

    async fn remove_binding(&self, address_id: &AddressId) -> Result<()> {
        self.inner.remove_binding(address_id).await
    }

    fn sync_checkpoint(&self) -> SyncCheckpoint {
        self.inner.sync_checkpoint()
    }

    async fn set_sync_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        self.inner.set_sync_checkpoint(checkpoint).await
    }

    async fn clear_sync_checkpoint(&self) -> Result<()> {
        if self.fail_clear_checkpoint.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("disk full")));
        }
        self.inner.clear_sync_checkpoint().await
    }

    fn bridge_secret(&self) -> Vec<u8> {
        self.inner.bridge_secret()
    }

    fn key_passphrase(&self) -> Vec<u8> {
        self.inner.key_passphrase()
    }

    fn encryption_key(&self) -> Vec<u8> {
        self.inner.encryption_key()
    }

    async fn set_credential(&self, credential: &Credential) -> Result<()> {
        self.inner.set_credential(credential).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// A session wired to fakes and an in-memory vault.
pub struct Harness {
    pub store: VaultStore,
    pub secrets: Arc<MemorySecretStore>,
    pub vault: Arc<dyn Vault>,
    pub flaky: Arc<FlakyVault>,
    pub remote: Arc<FakeRemote>,
    pub session: UserSession,
}

pub fn identity() -> AccountIdentity {
    AccountIdentity {
        id: UserId::new(USER),
        name: "alice".into(),
        used_space: 10,
        max_space: 100,
    }
}

pub fn config() -> SessionConfig {
    SessionConfig {
        event_period: Duration::from_millis(10),
        event_jitter: Duration::ZERO,
        sync_page_size: 2,
    }
}

pub fn message(id: &str, address_id: &str) -> MessageMeta {
    MessageMeta {
        id: MessageId::new(id),
        address_id: AddressId::new(address_id),
        label_ids: vec![LabelId::new("inbox")],
        unread: true,
    }
}

/// Primary `a`, secondary `b`.
pub fn two_addresses() -> Vec<Address> {
    vec![
        Address::new("a", "alice@example.com", 1),
        Address::new("b", "alias@example.com", 2),
    ]
}

pub async fn vault(mode: AddressMode) -> (VaultStore, Arc<MemorySecretStore>, Arc<dyn Vault>) {
    let secrets = Arc::new(MemorySecretStore::new());
    let store = VaultStore::in_memory(Arc::clone(&secrets) as Arc<dyn SecretStore>)
        .await
        .unwrap();
    let vault = store
        .create_user(NewUser {
            user_id: UserId::new(USER),
            key_passphrase: b"passphrase".to_vec(),
            credential: Credential {
                uid: "uid-1".into(),
                refresh_token: "refresh-1".into(),
            },
            address_mode: mode,
        })
        .await
        .unwrap();
    (store, secrets, Arc::new(vault))
}

pub async fn harness(addresses: Vec<Address>, mode: AddressMode) -> Harness {
    harness_with(FakeRemote::new(addresses), mode).await
}

/// Like `harness`, with a remote the test scripted beforehand.
pub async fn harness_with(remote: Arc<FakeRemote>, mode: AddressMode) -> Harness {
    let (store, secrets, inner) = vault(mode).await;
    let flaky = Arc::new(FlakyVault::new(inner));
    let vault = Arc::clone(&flaky) as Arc<dyn Vault>;
    let session = UserSession::new(
        Arc::clone(&vault),
        Arc::clone(&remote) as Arc<dyn RemoteClient>,
        identity(),
        config(),
    )
    .await
    .unwrap();

    Harness {
        store,
        secrets,
        vault,
        flaky,
        remote,
        session,
    }
}

/// A registry with a recording server and reporter, holding the harness's session.
pub async fn fleet(
    h: &Harness,
) -> (Arc<AccountRegistry>, Arc<RecordingServer>, Arc<RecordingReporter>) {
    let server = Arc::new(RecordingServer::default());
    let reporter = Arc::new(RecordingReporter::default());
    let registry = Arc::new(AccountRegistry::new(
        Some(Arc::clone(&server) as Arc<dyn ProtocolServer>),
        Arc::clone(&reporter) as Arc<dyn Reporter>,
    ));
    registry.add_account(h.session.clone()).await.unwrap();
    (registry, server, reporter)
}

/// Poll `check` until it holds, failing the test after a while.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receive events until one matches.
pub async fn next_matching(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    within(async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(PATIENCE, fut).await.unwrap()
}

/// Wait until the session's initial sync settled and its event loop runs.
pub async fn settled(session: &UserSession) {
    eventually("event loop", || session.is_consuming_events()).await;
}
