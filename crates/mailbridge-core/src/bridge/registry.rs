//! The fleet of logged-in accounts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatcher::EventDispatcher;
use super::policy::BadEventPolicy;
use super::reporter::{ReportContext, Reporter};
use crate::account::{AddressId, AddressMode, UserId};
use crate::server::ProtocolServer;
use crate::session::{SessionEvent, UserSession};
use crate::{Error, Result};

/// Capacity of the notice channel. Slow subscribers miss older notices.
const NOTICE_CAPACITY: usize = 64;

/// Fleet-level notification for observers.
#[derive(Debug, Clone)]
pub enum AccountNotice {
    /// The account left the fleet.
    LoggedOut {
        /// Account.
        user_id: UserId,
        /// Logged out by the bridge rather than by the user.
        forced: bool,
    },
    /// Sync progress of an account.
    Sync(SessionEvent),
}

/// One registered account.
pub(crate) struct AccountSlot {
    pub(crate) session: UserSession,
    /// Serializes every mutating operation on the account.
    pub(crate) lock: tokio::sync::Mutex<()>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the logged-in accounts and their protocol-server registrations.
pub struct AccountRegistry {
    accounts: RwLock<HashMap<UserId, Arc<AccountSlot>>>,
    server: Option<Arc<dyn ProtocolServer>>,
    reporter: Arc<dyn Reporter>,
    policy: BadEventPolicy,
    notices: broadcast::Sender<AccountNotice>,
}

impl std::fmt::Debug for AccountRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountRegistry")
            .field("accounts", &self.user_ids())
            .field("has_server", &self.server.is_some())
            .finish_non_exhaustive()
    }
}

impl AccountRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(server: Option<Arc<dyn ProtocolServer>>, reporter: Arc<dyn Reporter>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            accounts: RwLock::new(HashMap::new()),
            server,
            reporter,
            policy: BadEventPolicy::new(),
            notices,
        }
    }

    /// Register a session: attach it to the protocol server and start
    /// dispatching its lifecycle events.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the account is registered, `Config` if
    /// its events are already consumed elsewhere, or the provisioning error.
    pub async fn add_account(self: &Arc<Self>, session: UserSession) -> Result<()> {
        let user_id = session.id().clone();
        if self.slots().contains_key(&user_id) {
            return Err(Error::AlreadyExists(format!("account {user_id}")));
        }

        let events = session
            .take_events()
            .ok_or_else(|| {
                Error::Config(format!("events of account {user_id} are already taken"))
            })?;

        if self.server.is_some() {
            self.provision_account(&session).await?;
        } else {
            debug!(user_id = %user_id, "No protocol server attached, skipping provisioning");
        }

        let slot = Arc::new(AccountSlot {
            session,
            lock: tokio::sync::Mutex::new(()),
            dispatcher: Mutex::new(None),
        });

        {
            let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
            if accounts.contains_key(&user_id) {
                return Err(Error::AlreadyExists(format!("account {user_id}")));
            }
            accounts.insert(user_id.clone(), Arc::clone(&slot));
        }
        self.policy.track(&user_id);

        let dispatcher = EventDispatcher::new(Arc::downgrade(self), user_id.clone(), events);
        *slot.dispatcher.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(tokio::spawn(dispatcher.run()));

        info!(user_id = %user_id, "Account added");
        Ok(())
    }

    /// Session of a registered account.
    #[must_use]
    pub fn account(&self, user_id: &UserId) -> Option<UserSession> {
        self.slots().get(user_id).map(|slot| slot.session.clone())
    }

    /// IDs of every registered account.
    #[must_use]
    pub fn user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.slots().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Choose whether bad events of an account trigger a repair resync.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is not registered.
    pub fn set_bad_event_feedback(&self, user_id: &UserId, repair: bool) -> Result<()> {
        self.policy.set(user_id, repair)
    }

    /// Switch an account's address mode, re-registering it with the protocol server.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown accounts, or the first failing step.
    pub async fn set_address_mode(&self, user_id: &UserId, mode: AddressMode) -> Result<()> {
        let slot = self.slot(user_id)?;
        let _guard = slot.lock.lock().await;
        let session = &slot.session;

        if session.address_mode() == mode {
            debug!(user_id = %user_id, %mode, "Address mode unchanged");
            return Ok(());
        }

        // The session rolls itself back on failure, leaving registrations as they were.
        session.set_address_mode(mode).await?;

        if self.server.is_some() {
            self.deprovision_account(session, true).await?;
            self.provision_account(session).await?;
        }

        Ok(())
    }

    /// Log an account out at the user's request: deregister it, revoke the
    /// remote session, wipe its vault and close it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown accounts, or the first failing step.
    /// Later steps still run.
    pub async fn logout_account(&self, user_id: &UserId) -> Result<()> {
        let slot = self.slot(user_id)?;
        let _guard = slot.lock.lock().await;
        self.logout_locked(&slot, true, true, false).await
    }

    /// Observe fleet notices.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AccountNotice> {
        self.notices.subscribe()
    }

    /// Close every account. Registrations and vaults are kept for the next start.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<AccountSlot>> = self
            .accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();

        for slot in slots {
            let _guard = slot.lock.lock().await;
            slot.session.close().await;
            self.policy.untrack(slot.session.id());
            if let Some(handle) = slot
                .dispatcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                handle.abort();
            }
        }

        info!("Account registry shut down");
    }

    pub(crate) fn slot(&self, user_id: &UserId) -> Result<Arc<AccountSlot>> {
        self.slots()
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("account {user_id}")))
    }

    fn slots(&self) -> std::sync::RwLockReadGuard<'_, HashMap<UserId, Arc<AccountSlot>>> {
        self.accounts.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) const fn policy(&self) -> &BadEventPolicy {
        &self.policy
    }

    pub(crate) fn server(&self) -> Result<&Arc<dyn ProtocolServer>> {
        self.server.as_ref().ok_or(Error::NoProtocolServer)
    }

    pub(crate) fn notify(&self, notice: AccountNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    pub(crate) fn report(&self, message: &str, context: &ReportContext) {
        if let Err(e) = self.reporter.report_message_with_context(message, context) {
            warn!(error = %e, "Failed to report: {message}");
        }
    }

    /// Register every connector the account's mode calls for.
    ///
    /// Existing bindings are re-attached; stale ones are replaced.
    pub(crate) async fn provision_account(&self, session: &UserSession) -> Result<()> {
        let server = self.server()?;
        let key = session.encryption_key();

        for connector in session.build_connectors() {
            let address_id = connector.address_id().clone();

            if let Some(binding) = session.binding(&address_id) {
                match server.load(connector, &binding, &key).await {
                    Ok(()) => {
                        debug!(
                            user_id = %session.id(),
                            address_id = %address_id,
                            "Loaded existing registration"
                        );
                        continue;
                    }
                    Err(e) if e.is_not_found() => {
                        warn!(
                            user_id = %session.id(),
                            address_id = %address_id,
                            "Stale binding, provisioning anew"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            self.provision_address(session, &address_id).await?;
        }

        Ok(())
    }

    /// Register one address and persist its binding.
    pub(crate) async fn provision_address(
        &self,
        session: &UserSession,
        address_id: &AddressId,
    ) -> Result<()> {
        let server = self.server()?;
        let connector = session.connector(address_id)?;
        let binding = server
            .provision(connector, &session.encryption_key())
            .await?;
        session.set_binding(address_id, &binding).await?;
        debug!(
            user_id = %session.id(),
            address_id = %address_id,
            binding = %binding,
            "Provisioned address"
        );
        Ok(())
    }

    /// Drop every registration of the account. Already-absent ones are fine.
    ///
    /// With `remove_data` the bindings are forgotten too; otherwise they are
    /// kept so the registrations can be re-attached later.
    pub(crate) async fn deprovision_account(
        &self,
        session: &UserSession,
        remove_data: bool,
    ) -> Result<()> {
        let server = self.server()?;

        for (address_id, binding) in session.bindings() {
            match server.deprovision(&binding, remove_data).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(
                        user_id = %session.id(),
                        address_id = %address_id,
                        "Registration already absent"
                    );
                }
                Err(e) => return Err(e),
            }

            if remove_data {
                session.remove_binding(&address_id).await?;
            }
        }

        Ok(())
    }

    /// Remove an account from the fleet. The caller holds the account lock.
    pub(crate) async fn logout_locked(
        &self,
        slot: &AccountSlot,
        revoke: bool,
        clear: bool,
        forced: bool,
    ) -> Result<()> {
        let session = &slot.session;
        let user_id = session.id().clone();
        let mut first_err = None;

        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user_id);
        self.policy.untrack(&user_id);

        if self.server.is_some() {
            if let Err(e) = self.deprovision_account(session, clear).await {
                warn!(user_id = %user_id, error = %e, "Failed to deregister account");
                first_err.get_or_insert(e);
            }
        }

        if revoke {
            if let Err(e) = session.revoke().await {
                warn!(user_id = %user_id, error = %e, "Failed to revoke remote session");
                first_err.get_or_insert(e);
            }
        }

        if clear {
            if let Err(e) = session.vault().clear().await {
                warn!(user_id = %user_id, error = %e, "Failed to clear vault");
                first_err.get_or_insert(e);
            }
        }

        session.close().await;

        info!(user_id = %user_id, forced, "Account logged out");
        self.notify(AccountNotice::LoggedOut { user_id, forced });

        first_err.map_or(Ok(()), Err)
    }
}
