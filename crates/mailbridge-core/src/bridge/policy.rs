//! Whether a bad remote event should be repaired or end in a logout.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::account::UserId;
use crate::{Error, Result};

/// Per-account choice between repair resync and forced logout.
///
/// Accounts start out declining repair.
#[derive(Debug, Default)]
pub struct BadEventPolicy {
    repair: RwLock<HashMap<UserId, bool>>,
}

impl BadEventPolicy {
    /// Create an empty policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an account. Existing choices are kept.
    pub fn track(&self, user_id: &UserId) {
        self.repair
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id.clone())
            .or_insert(false);
    }

    /// Stop tracking an account.
    pub fn untrack(&self, user_id: &UserId) {
        self.repair
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id);
    }

    /// Record whether bad events of an account should be repaired.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is not tracked.
    pub fn set(&self, user_id: &UserId, repair: bool) -> Result<()> {
        let mut map = self.repair.write().unwrap_or_else(PoisonError::into_inner);
        let entry = map
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("account {user_id}")))?;
        *entry = repair;
        Ok(())
    }

    /// Whether a repair resync should be attempted.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is not tracked.
    pub fn should_repair(&self, user_id: &UserId) -> Result<bool> {
        self.repair
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("account {user_id}")))
    }
}
