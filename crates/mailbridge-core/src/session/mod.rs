//! The per-account session.
//!
//! A [`UserSession`] owns everything derived locally from one remote
//! account: identity, address directory, update routing, the resync
//! controller and the remote-event consumption loop. Lifecycle changes it
//! cannot resolve alone are pushed to its [`EventQueue`] for the fleet-level
//! dispatcher.

mod apply;
mod auth;
mod connector;
mod event;
mod queue;
mod resync;
mod router;
mod smtp;
mod sync;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use auth::{constant_time_eq, hex_decode, hex_encode};
pub use connector::Connector;
pub use event::{EventQueue, SessionEvent};
pub use queue::{MailboxUpdate, Queue, UpdateSink};
pub use router::{StagedRoutes, UpdateRouter};
pub use smtp::SmtpSession;
pub use sync::{SyncCancel, SyncController, SyncJob, SyncLock, SyncOutcome};

use crate::account::{AccountIdentity, Address, AddressDirectory, AddressId, AddressMode, UserId};
use crate::config::SessionConfig;
use crate::remote::RemoteClient;
use crate::server::BindingToken;
use crate::vault::Vault;
use crate::{Error, Result};
use resync::Resync;

/// A running consumption loop and its stop signal.
struct EventLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct SessionInner {
    user_id: UserId,
    identity: RwLock<AccountIdentity>,
    addresses: Arc<AddressDirectory>,
    router: Arc<UpdateRouter>,
    sync: SyncController,
    remote: Arc<dyn RemoteClient>,
    vault: Arc<dyn Vault>,
    events: Arc<EventQueue>,
    config: SessionConfig,
    closed: AtomicBool,
    event_loop: Mutex<Option<EventLoop>>,
}

/// Handle to one authenticated account. Cheap to clone.
#[derive(Clone)]
pub struct UserSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("user_id", &self.inner.user_id)
            .field("address_mode", &self.address_mode())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl UserSession {
    /// Bring an authenticated account online.
    ///
    /// Fetches the addresses, checks the stored key passphrase unlocks them,
    /// seeds the event cursor on first use, builds update routing for the
    /// persisted address mode, and registers credential/deauth handlers.
    /// The initial sync then runs in the background; event consumption
    /// starts once it settles, whatever its outcome.
    ///
    /// # Errors
    ///
    /// Returns `Unlock` if the keys cannot be unlocked, or the remote/vault
    /// error of any other step.
    pub async fn new(
        vault: Arc<dyn Vault>,
        remote: Arc<dyn RemoteClient>,
        identity: AccountIdentity,
        config: SessionConfig,
    ) -> Result<Self> {
        let user_id = identity.id.clone();

        let addrs = remote.fetch_addresses().await?;

        remote
            .unlock(&identity, &addrs, &vault.key_passphrase())
            .map_err(|e| match e {
                Error::Unlock(_) => e,
                other => Error::Unlock(other.to_string()),
            })?;

        if vault.event_cursor().is_none() {
            let cursor = remote.latest_event_cursor().await?;
            vault.set_event_cursor(&cursor).await?;
            debug!(user_id = %user_id, cursor = %cursor, "Seeded event cursor");
        }

        let addresses = Arc::new(AddressDirectory::new(addrs));
        let router = Arc::new(UpdateRouter::new(vault.address_mode(), &addresses.ids()));
        let events = Arc::new(EventQueue::new());

        let job = Arc::new(Resync::new(
            user_id.clone(),
            Arc::clone(&vault),
            Arc::clone(&remote),
            Arc::clone(&addresses),
            Arc::clone(&router),
            config.sync_page_size,
        ));
        let sync = SyncController::new(user_id.clone(), job, Arc::clone(&events));

        let session = Self {
            inner: Arc::new(SessionInner {
                user_id,
                identity: RwLock::new(identity),
                addresses,
                router,
                sync,
                remote,
                vault,
                events,
                config,
                closed: AtomicBool::new(false),
                event_loop: Mutex::new(None),
            }),
        };

        session.register_handlers();
        session.spawn_initial_sync();

        info!(user_id = %session.id(), "Session started");
        Ok(session)
    }

    fn register_handlers(&self) {
        let vault = Arc::clone(&self.inner.vault);
        let user_id = self.inner.user_id.clone();
        self.inner.remote.on_credential_renewed(Box::new(move |credential| {
            let vault = Arc::clone(&vault);
            let user_id = user_id.clone();
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                warn!(user_id = %user_id, "Dropping renewed credential: no runtime");
                return;
            };
            runtime.spawn(async move {
                if let Err(e) = vault.set_credential(&credential).await {
                    warn!(user_id = %user_id, error = %e, "Failed to store renewed credential");
                }
            });
        }));

        let events = Arc::clone(&self.inner.events);
        let user_id = self.inner.user_id.clone();
        self.inner.remote.on_deauthorized(Box::new(move || {
            info!(user_id = %user_id, "Remote session deauthorized");
            events.enqueue(SessionEvent::Deauthorized {
                user_id: user_id.clone(),
            });
        }));
    }

    fn spawn_initial_sync(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            match session.inner.sync.start().await {
                Ok(SyncOutcome::Skipped) => session.inner.sync.wait().await,
                Ok(_) => {}
                Err(e) => warn!(user_id = %session.id(), error = %e, "Initial sync failed"),
            }
            session.start_event_loop();
        });
    }

    fn spawn_sync(&self, reason: &'static str) {
        if self.is_closed() {
            return;
        }

        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.inner.sync.start().await {
                warn!(user_id = %session.id(), error = %e, reason, "Sync failed");
            }
        });
    }

    /// Account ID.
    #[must_use]
    pub fn id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// Account snapshot.
    #[must_use]
    pub fn identity(&self) -> AccountIdentity {
        self.inner
            .identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Account name.
    #[must_use]
    pub fn name(&self) -> String {
        self.identity().name
    }

    /// Bytes used on the remote side.
    #[must_use]
    pub fn used_space(&self) -> u64 {
        self.identity().used_space
    }

    /// Bytes available on the remote side.
    #[must_use]
    pub fn max_space(&self) -> u64 {
        self.identity().max_space
    }

    pub(crate) fn replace_identity(&self, identity: AccountIdentity) {
        *self
            .inner
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = identity;
    }

    /// Whether `query` is the account name or one of its emails.
    #[must_use]
    pub fn matches(&self, query: &str) -> bool {
        self.name() == query || self.inner.addresses.has_email(query)
    }

    /// Emails, primary first.
    #[must_use]
    pub fn emails(&self) -> Vec<String> {
        self.inner.addresses.emails()
    }

    /// Addresses, primary first.
    #[must_use]
    pub fn addresses(&self) -> Vec<Address> {
        self.inner.addresses.snapshot()
    }

    /// Look up an address.
    #[must_use]
    pub fn address(&self, id: &AddressId) -> Option<Address> {
        self.inner.addresses.get(id)
    }

    /// Current address mode.
    #[must_use]
    pub fn address_mode(&self) -> AddressMode {
        self.inner.vault.address_mode()
    }

    /// Switch the address mode.
    ///
    /// Stops any running sync and blocks new ones, stages a fresh sink set,
    /// persists the mode and clears the sync checkpoint, then swaps the sinks
    /// in and closes the old ones. A new sync starts afterwards. If
    /// persisting fails nothing changes.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the mode or the cleared checkpoint cannot be persisted.
    pub async fn set_address_mode(&self, mode: AddressMode) -> Result<()> {
        let inner = &self.inner;

        inner.sync.abort();
        let lock = inner.sync.lock().await;

        let previous = inner.vault.address_mode();
        let staged = UpdateRouter::stage(mode, &inner.addresses.ids());

        if let Err(e) = inner.vault.set_address_mode(mode).await {
            staged.discard();
            return Err(Error::Config(format!("failed to set address mode: {e}")));
        }

        if let Err(e) = inner.vault.clear_sync_checkpoint().await {
            if let Err(restore) = inner.vault.set_address_mode(previous).await {
                warn!(user_id = %inner.user_id, error = %restore, "Failed to restore address mode");
            }
            staged.discard();
            return Err(Error::Config(format!("failed to clear sync status: {e}")));
        }

        let closed = inner.router.commit(staged);
        lock.unlock();

        info!(user_id = %inner.user_id, %previous, %mode, closed, "Address mode changed");
        self.spawn_sync("address mode changed");
        Ok(())
    }

    /// Persisted protocol-server bindings.
    #[must_use]
    pub fn bindings(&self) -> HashMap<AddressId, BindingToken> {
        self.inner.vault.bindings()
    }

    /// Binding of one address.
    #[must_use]
    pub fn binding(&self, address_id: &AddressId) -> Option<BindingToken> {
        self.inner.vault.bindings().remove(address_id)
    }

    /// Persist a binding for a known address.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the address is unknown, or the vault error.
    pub async fn set_binding(&self, address_id: &AddressId, binding: &BindingToken) -> Result<()> {
        if !self.inner.addresses.contains(address_id) {
            return Err(Error::NotFound(format!("address {address_id}")));
        }
        self.inner.vault.set_binding(address_id, binding).await
    }

    /// Forget the binding of an address.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the address has no binding, or the vault error.
    pub async fn remove_binding(&self, address_id: &AddressId) -> Result<()> {
        if self.binding(address_id).is_none() {
            return Err(Error::NotFound(format!("binding for address {address_id}")));
        }
        self.inner.vault.remove_binding(address_id).await
    }

    /// Key the protocol server encrypts this account's store with.
    #[must_use]
    pub fn encryption_key(&self) -> Vec<u8> {
        self.inner.vault.encryption_key()
    }

    /// Password mail clients use, hex encoded.
    #[must_use]
    pub fn bridge_password(&self) -> String {
        hex_encode(&self.inner.vault.bridge_secret())
    }

    /// Connectors for every registration the current mode calls for.
    ///
    /// Combined mode yields one connector for the primary address; split
    /// mode one per enabled address.
    #[must_use]
    pub fn build_connectors(&self) -> Vec<Connector> {
        let addrs = match self.address_mode() {
            AddressMode::Combined => self.inner.addresses.primary().into_iter().collect(),
            AddressMode::Split => self
                .inner
                .addresses
                .snapshot()
                .into_iter()
                .filter(|addr| addr.enabled)
                .collect::<Vec<_>>(),
        };

        addrs
            .into_iter()
            .filter_map(|addr| self.connector(&addr.id).ok())
            .collect()
    }

    /// Connector for one address.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the address has no update sink.
    pub fn connector(&self, address_id: &AddressId) -> Result<Connector> {
        let sink = self
            .inner
            .router
            .get(address_id)
            .ok_or_else(|| Error::NotFound(format!("update sink for address {address_id}")))?;
        Ok(Connector::new(self.clone(), address_id.clone(), sink))
    }

    /// Check client credentials and resolve the email to an address.
    ///
    /// `password` is the hex-encoded bridge password. The email is matched
    /// case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredentials` for a wrong password or unknown email alike.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<AddressId> {
        let secret = self.inner.vault.bridge_secret();
        let supplied = hex_decode(password).unwrap_or_default();

        if secret.is_empty() || !constant_time_eq(&secret, &supplied) {
            debug!(user_id = %self.id(), "Rejected bridge password");
            return Err(Error::InvalidCredentials);
        }

        self.inner
            .addresses
            .by_email(email)
            .map(|addr| addr.id)
            .ok_or(Error::InvalidCredentials)
    }

    /// Authenticate a sending client and bind it to the address it logged in as.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredentials` like [`UserSession::authenticate`].
    pub fn smtp_session(&self, email: &str, password: &str) -> Result<SmtpSession> {
        let address_id = self.authenticate(email, password)?;
        debug!(user_id = %self.id(), address_id = %address_id, "Opened SMTP session");
        Ok(SmtpSession::new(self.clone(), address_id, email.to_string()))
    }

    /// Connectivity came back: sync in the background if needed.
    pub fn on_connectivity_up(&self) {
        info!(user_id = %self.id(), "Connection up, checking if sync is needed");
        self.spawn_sync("connection up");
    }

    /// Connectivity was lost: abort any running sync.
    pub fn on_connectivity_down(&self) {
        info!(user_id = %self.id(), "Connection down, aborting any ongoing syncs");
        self.inner.sync.abort();
    }

    /// Run a sync now unless one is running or the account is synced.
    ///
    /// # Errors
    ///
    /// Returns the sync failure.
    pub async fn start_sync(&self) -> Result<SyncOutcome> {
        self.inner.sync.start().await
    }

    /// The account's sync controller.
    #[must_use]
    pub fn sync_controller(&self) -> &SyncController {
        &self.inner.sync
    }

    /// Rebuild the account from scratch after a bad event.
    ///
    /// Stops event consumption, jumps the cursor to the newest event, clears
    /// the sync checkpoint and runs a full sync to completion before
    /// consuming events again.
    ///
    /// # Errors
    ///
    /// Returns the remote, vault or sync error. Event consumption stays
    /// stopped in that case.
    pub async fn resync(&self) -> Result<()> {
        let inner = &self.inner;
        info!(user_id = %inner.user_id, "Starting repair resync");

        self.stop_event_loop().await;

        let cursor = inner.remote.latest_event_cursor().await?;
        inner.vault.set_event_cursor(&cursor).await?;

        inner.sync.abort();
        {
            let _lock = inner.sync.lock().await;
            inner.vault.clear_sync_checkpoint().await?;
        }

        loop {
            match inner.sync.start().await? {
                SyncOutcome::Skipped => drop(inner.sync.lock().await),
                SyncOutcome::AlreadyComplete | SyncOutcome::Completed => break,
            }
        }

        self.start_event_loop();
        info!(user_id = %inner.user_id, "Repair resync finished");
        Ok(())
    }

    /// Restart event consumption if it halted. No-op while it runs.
    pub fn resume_event_loop(&self) {
        self.start_event_loop();
    }

    /// Whether the event consumption loop is running.
    #[must_use]
    pub fn is_consuming_events(&self) -> bool {
        self.inner
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    fn start_event_loop(&self) {
        let inner = &self.inner;
        let mut slot = inner
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.is_closed() {
            return;
        }
        if slot.as_ref().is_some_and(|running| !running.handle.is_finished()) {
            return;
        }

        let from = inner.vault.event_cursor().unwrap_or_default();
        debug!(user_id = %inner.user_id, cursor = %from, "Starting event loop");
        let stream = inner
            .remote
            .event_stream(inner.config.event_period, inner.config.event_jitter, from);

        let (stop, stop_rx) = watch::channel(false);
        let session = self.clone();
        let handle = tokio::spawn(async move { session.consume(stream, stop_rx).await });
        *slot = Some(EventLoop { stop, handle });
    }

    async fn stop_event_loop(&self) {
        let running = self
            .inner
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(running) = running {
            running.stop.send_replace(true);
            if let Err(e) = running.handle.await {
                warn!(user_id = %self.id(), error = %e, "Event loop task failed");
            }
        }
    }

    /// Revoke the remote session.
    ///
    /// # Errors
    ///
    /// Returns the remote error.
    pub async fn revoke(&self) -> Result<()> {
        self.inner.remote.revoke_session().await
    }

    /// Revoke the remote session and wipe the vault.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the vault is left alone if revocation fails.
    pub async fn logout(&self) -> Result<()> {
        self.revoke().await?;
        self.inner.vault.clear().await?;
        info!(user_id = %self.id(), "Logged out");
        Ok(())
    }

    /// Take the lifecycle-event receiver. Only the first caller gets it.
    pub fn take_events(&self) -> Option<UnboundedReceiver<SessionEvent>> {
        self.inner.events.take_receiver()
    }

    /// The account's vault.
    #[must_use]
    pub fn vault(&self) -> &Arc<dyn Vault> {
        &self.inner.vault
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Release everything the session holds.
    ///
    /// Every step runs even if an earlier one fails; failures are logged.
    /// Later calls do nothing.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            debug!(user_id = %inner.user_id, "Session already closed");
            return;
        }

        self.stop_event_loop().await;

        inner.sync.abort();
        let lock = inner.sync.lock().await;

        if let Err(e) = inner.remote.close().await {
            warn!(user_id = %inner.user_id, error = %e, "Failed to close remote client");
        }

        let sinks = inner.router.close_all();
        debug!(user_id = %inner.user_id, sinks, "Closed update sinks");

        inner.events.close();

        if let Err(e) = inner.vault.close().await {
            warn!(user_id = %inner.user_id, error = %e, "Failed to close vault");
        }

        drop(lock);
        info!(user_id = %inner.user_id, "Session closed");
    }
}
