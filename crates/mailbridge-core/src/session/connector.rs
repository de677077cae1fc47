//! Handle given to the protocol server for one exposed mailbox namespace.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use super::UserSession;
use super::queue::{MailboxUpdate, UpdateSink};
use crate::account::{AddressId, AddressMode};

/// Binds one address of a session to a protocol-server registration.
///
/// In combined mode the connector of the primary address serves every
/// address of the account.
#[derive(Debug, Clone)]
pub struct Connector {
    session: UserSession,
    address_id: AddressId,
    updates: Arc<UpdateSink>,
}

impl Connector {
    pub(super) const fn new(
        session: UserSession,
        address_id: AddressId,
        updates: Arc<UpdateSink>,
    ) -> Self {
        Self {
            session,
            address_id,
            updates,
        }
    }

    /// Address this connector is bound to.
    #[must_use]
    pub const fn address_id(&self) -> &AddressId {
        &self.address_id
    }

    /// Account behind the connector.
    #[must_use]
    pub const fn session(&self) -> &UserSession {
        &self.session
    }

    /// Emails served by this namespace.
    #[must_use]
    pub fn emails(&self) -> Vec<String> {
        match self.session.address_mode() {
            AddressMode::Combined => self.session.emails(),
            AddressMode::Split => self
                .session
                .address(&self.address_id)
                .map(|addr| vec![addr.email])
                .unwrap_or_default(),
        }
    }

    /// Check client credentials against this namespace.
    ///
    /// In split mode the email must belong to this connector's address.
    #[must_use]
    pub fn authorize(&self, email: &str, password: &str) -> bool {
        let Ok(address_id) = self.session.authenticate(email, password) else {
            return false;
        };

        match self.session.address_mode() {
            AddressMode::Combined => true,
            AddressMode::Split => address_id == self.address_id,
        }
    }

    /// Take the stream of mailbox updates. Only the first caller gets it.
    pub fn take_updates(&self) -> Option<UnboundedReceiver<MailboxUpdate>> {
        self.updates.take_receiver()
    }

    /// Whether the update sink was closed, e.g. by a mode switch.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.updates.is_closed()
    }
}
