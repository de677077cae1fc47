//! Reaction to session lifecycle events.
//!
//! Each account gets its own dispatcher task. Events of one account are
//! handled one at a time under the account lock, in emission order; events
//! of different accounts are handled concurrently.

use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use super::registry::{AccountNotice, AccountRegistry, AccountSlot};
use super::reporter::ReportContext;
use crate::account::{AddressId, AddressMode, UserId};
use crate::remote::Cursor;
use crate::session::{SessionEvent, UserSession};
use crate::{Error, Result};

/// Drains one account's lifecycle events.
pub struct EventDispatcher {
    registry: Weak<AccountRegistry>,
    user_id: UserId,
    events: UnboundedReceiver<SessionEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher for `user_id` reading from `events`.
    #[must_use]
    pub const fn new(
        registry: Weak<AccountRegistry>,
        user_id: UserId,
        events: UnboundedReceiver<SessionEvent>,
    ) -> Self {
        Self {
            registry,
            user_id,
            events,
        }
    }

    /// Handle events until the session's queue closes or the registry is gone.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            let Some(registry) = self.registry.upgrade() else {
                break;
            };

            if event.is_sync_progress() {
                registry.notify(AccountNotice::Sync(event));
                continue;
            }

            match registry.dispatch(&self.user_id, event).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() && registry.slot(&self.user_id).is_err() => {
                    debug!(user_id = %self.user_id, "Dropped event of removed account");
                }
                Err(e) => {
                    warn!(user_id = %self.user_id, error = %e, "Failed to handle user event");
                }
            }
        }

        debug!(user_id = %self.user_id, "Event dispatcher stopped");
    }
}

impl AccountRegistry {
    /// Handle one lifecycle event of an account under its account lock.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown accounts, or the handler's error.
    /// Bad events and deauthorization never fail: they end in a repair or a logout.
    pub async fn dispatch(&self, user_id: &UserId, event: SessionEvent) -> Result<()> {
        let slot = self.slot(user_id)?;
        let _guard = slot.lock.lock().await;
        handle_event(self, &slot, event).await
    }
}

/// Handle one lifecycle event. The caller holds the account lock.
async fn handle_event(
    registry: &AccountRegistry,
    slot: &AccountSlot,
    event: SessionEvent,
) -> Result<()> {
    let session = &slot.session;

    match event {
        SessionEvent::AddressCreated { address_id, .. } => {
            handle_address_created(registry, session, &address_id).await
        }

        SessionEvent::AddressUpdated { address_id, .. } => {
            handle_address_updated(registry, session, &address_id).await
        }

        SessionEvent::AddressDeleted { address_id, .. } => {
            handle_address_deleted(registry, session, &address_id).await
        }

        SessionEvent::AccountRefreshed { .. } => {
            registry.deprovision_account(session, true).await?;
            registry.provision_account(session).await
        }

        SessionEvent::Deauthorized { .. } => {
            info!(user_id = %session.id(), "Logging out deauthorized account");
            force_logout(registry, slot, false).await;
            Ok(())
        }

        SessionEvent::UnrecoverableEvent {
            old_cursor,
            new_cursor,
            payload,
            error,
            ..
        } => {
            handle_bad_event(registry, slot, old_cursor.as_ref(), &new_cursor, payload, &error)
                .await;
            Ok(())
        }

        SessionEvent::UncategorizedError { error, .. } => {
            let mut context = ReportContext::new();
            context.insert("error_type".into(), error.kind().into());
            context.insert("error".into(), error.to_string().into());
            registry.report("Failed to handle due to uncategorized error", &context);
            session.resume_event_loop();
            Ok(())
        }

        SessionEvent::SyncStarted { .. }
        | SessionEvent::SyncFinished { .. }
        | SessionEvent::SyncFailed { .. } => {
            registry.notify(AccountNotice::Sync(event));
            Ok(())
        }
    }
}

async fn handle_address_created(
    registry: &AccountRegistry,
    session: &UserSession,
    address_id: &AddressId,
) -> Result<()> {
    if session.address_mode() != AddressMode::Split {
        return Ok(());
    }

    let address = session
        .address(address_id)
        .ok_or_else(|| Error::NotFound(format!("address {address_id}")))?;
    if !address.enabled {
        debug!(
            user_id = %session.id(),
            address_id = %address_id,
            "Not registering disabled address"
        );
        return Ok(());
    }

    registry.server()?;
    registry.provision_address(session, address_id).await
}

/// Split mode follows the address's enabled flag; combined mode resolves addresses live.
async fn handle_address_updated(
    registry: &AccountRegistry,
    session: &UserSession,
    address_id: &AddressId,
) -> Result<()> {
    let address = session
        .address(address_id)
        .ok_or_else(|| Error::NotFound(format!("address {address_id}")))?;

    if session.address_mode() != AddressMode::Split {
        return Ok(());
    }

    let server = registry.server()?;

    match (address.enabled, session.binding(address_id)) {
        (false, Some(binding)) => {
            match server.deprovision(&binding, false).await {
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
            session.remove_binding(address_id).await?;
            info!(
                user_id = %session.id(),
                address_id = %address_id,
                "Deregistered disabled address"
            );
            Ok(())
        }
        (true, None) => registry.provision_address(session, address_id).await,
        _ => Ok(()),
    }
}

async fn handle_address_deleted(
    registry: &AccountRegistry,
    session: &UserSession,
    address_id: &AddressId,
) -> Result<()> {
    match session.address_mode() {
        AddressMode::Split => {
            let server = registry.server()?;

            let binding = session
                .binding(address_id)
                .ok_or_else(|| Error::NotFound(format!("binding for address {address_id}")))?;

            server.deprovision(&binding, true).await?;
            session.remove_binding(address_id).await
        }
        AddressMode::Combined => move_combined_binding(registry, session, address_id).await,
    }
}

/// The combined registration is keyed by the primary address. When that
/// address goes away the registration moves to the new primary.
async fn move_combined_binding(
    registry: &AccountRegistry,
    session: &UserSession,
    deleted: &AddressId,
) -> Result<()> {
    let Some(binding) = session.binding(deleted) else {
        return Ok(());
    };
    let server = registry.server()?;

    let Some(primary) = session.addresses().into_iter().next() else {
        match server.deprovision(&binding, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        return session.remove_binding(deleted).await;
    };

    session.set_binding(&primary.id, &binding).await?;
    session.remove_binding(deleted).await?;
    info!(
        user_id = %session.id(),
        from = %deleted,
        to = %primary.id,
        "Moved combined registration to new primary address"
    );

    registry.provision_account(session).await
}

async fn handle_bad_event(
    registry: &AccountRegistry,
    slot: &AccountSlot,
    old_cursor: Option<&Cursor>,
    new_cursor: &Cursor,
    payload: String,
    error: &Arc<Error>,
) {
    let session = &slot.session;

    let mut context = ReportContext::new();
    context.insert("user_id".into(), session.id().as_str().into());
    context.insert(
        "old_event_id".into(),
        old_cursor.map_or(Value::Null, |cursor| cursor.as_str().into()),
    );
    context.insert("new_event_id".into(), new_cursor.as_str().into());
    context.insert("event_info".into(), payload.into());
    context.insert("error".into(), error.to_string().into());
    context.insert("error_type".into(), error.kind().into());

    let repair = registry
        .policy()
        .should_repair(session.id())
        .unwrap_or(false);

    if !repair {
        registry.report("Failed to handle event: logout", &context);
        force_logout(registry, slot, true).await;
        return;
    }

    registry.report("Failed to handle event: repair", &context);

    if let Err(e) = session.resync().await {
        context.insert("error".into(), e.to_string().into());
        context.insert("error_type".into(), e.kind().into());
        registry.report("Failed to handle event: repair failed: logging out", &context);
        force_logout(registry, slot, true).await;
    }
}

/// Log the account out on the bridge's initiative, keeping its vault.
async fn force_logout(registry: &AccountRegistry, slot: &AccountSlot, revoke: bool) {
    if let Err(e) = registry.logout_locked(slot, revoke, false, true).await {
        warn!(user_id = %slot.session.id(), error = %e, "Forced logout finished with errors");
    }
}
