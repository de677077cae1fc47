//! Lifecycle events emitted by a session.

use std::sync::Arc;

use super::queue::Queue;
use crate::Error;
use crate::account::{AddressId, UserId};
use crate::remote::Cursor;

/// Notification about a session-level change, consumed by the dispatcher.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An address was added to the account.
    AddressCreated {
        /// Account.
        user_id: UserId,
        /// New address.
        address_id: AddressId,
        /// Its email.
        email: String,
    },
    /// An address changed.
    AddressUpdated {
        /// Account.
        user_id: UserId,
        /// Changed address.
        address_id: AddressId,
        /// Its email.
        email: String,
    },
    /// An address was removed from the account.
    AddressDeleted {
        /// Account.
        user_id: UserId,
        /// Removed address.
        address_id: AddressId,
        /// Its former email.
        email: String,
    },
    /// The account changed wholesale and was rebuilt locally.
    AccountRefreshed {
        /// Account.
        user_id: UserId,
    },
    /// The remote side invalidated the session.
    Deauthorized {
        /// Account.
        user_id: UserId,
    },
    /// A remote event could not be applied.
    UnrecoverableEvent {
        /// Account.
        user_id: UserId,
        /// Cursor before the event.
        old_cursor: Option<Cursor>,
        /// Cursor the event would have advanced to.
        new_cursor: Cursor,
        /// The event as received, serialized.
        payload: String,
        /// Why it could not be applied.
        error: Arc<Error>,
    },
    /// A failure not attributable to a specific account-state problem.
    UncategorizedError {
        /// Account.
        user_id: UserId,
        /// The failure.
        error: Arc<Error>,
    },
    /// A resync started.
    SyncStarted {
        /// Account.
        user_id: UserId,
    },
    /// A resync completed.
    SyncFinished {
        /// Account.
        user_id: UserId,
    },
    /// A resync failed or was aborted.
    SyncFailed {
        /// Account.
        user_id: UserId,
        /// Why.
        error: Arc<Error>,
    },
}

impl SessionEvent {
    /// The account the event is about.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        match self {
            Self::AddressCreated { user_id, .. }
            | Self::AddressUpdated { user_id, .. }
            | Self::AddressDeleted { user_id, .. }
            | Self::AccountRefreshed { user_id }
            | Self::Deauthorized { user_id }
            | Self::UnrecoverableEvent { user_id, .. }
            | Self::UncategorizedError { user_id, .. }
            | Self::SyncStarted { user_id }
            | Self::SyncFinished { user_id }
            | Self::SyncFailed { user_id, .. } => user_id,
        }
    }

    /// Whether this is a sync progress notification.
    #[must_use]
    pub const fn is_sync_progress(&self) -> bool {
        matches!(
            self,
            Self::SyncStarted { .. } | Self::SyncFinished { .. } | Self::SyncFailed { .. }
        )
    }
}

/// The session's outbound lifecycle-event queue.
pub type EventQueue = Queue<SessionEvent>;
