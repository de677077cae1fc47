//! Send-side handle for one authenticated mail client.

use crate::account::{AddressId, AddressMode};

use super::UserSession;

/// A mail client authenticated as one of the account's addresses.
///
/// Built by [`UserSession::smtp_session`]. The address the client logged in
/// with is kept for the lifetime of the handle.
#[derive(Clone)]
pub struct SmtpSession {
    session: UserSession,
    address_id: AddressId,
    email: String,
}

impl SmtpSession {
    pub(super) const fn new(session: UserSession, address_id: AddressId, email: String) -> Self {
        Self {
            session,
            address_id,
            email,
        }
    }

    /// Address the client authenticated as.
    #[must_use]
    pub const fn address_id(&self) -> &AddressId {
        &self.address_id
    }

    /// Email the client authenticated with, as typed.
    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Owning session.
    #[must_use]
    pub const fn session(&self) -> &UserSession {
        &self.session
    }

    /// Whether mail may go out with `from` as the sender.
    ///
    /// In split mode only the authenticated address may send. In combined
    /// mode any enabled address of the account may.
    #[must_use]
    pub fn can_send_from(&self, from: &str) -> bool {
        let Some(address) = self
            .session
            .addresses()
            .into_iter()
            .find(|addr| addr.email.eq_ignore_ascii_case(from))
        else {
            return false;
        };

        match self.session.address_mode() {
            AddressMode::Split => address.id == self.address_id,
            AddressMode::Combined => address.enabled,
        }
    }
}

impl std::fmt::Debug for SmtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSession")
            .field("user_id", self.session.id())
            .field("address_id", &self.address_id)
            .field("email", &self.email)
            .finish()
    }
}
