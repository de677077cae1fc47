//! Thread-safe directory of an account's addresses.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::model::{Address, AddressId};
use crate::{Error, Result};

/// The account's addresses, keyed by ID and ordered by ordinal.
///
/// Readers always see a consistent snapshot; mutations happen only in
/// response to remote address events or a refresh.
#[derive(Debug, Default)]
pub struct AddressDirectory {
    addrs: RwLock<HashMap<AddressId, Address>>,
}

impl AddressDirectory {
    /// Create a directory from a fetched address list.
    #[must_use]
    pub fn new(addrs: Vec<Address>) -> Self {
        Self {
            addrs: RwLock::new(index(addrs)),
        }
    }

    /// Replace the whole directory.
    pub fn replace(&self, addrs: Vec<Address>) {
        *self.addrs.write().unwrap_or_else(PoisonError::into_inner) = index(addrs);
    }

    /// All addresses, primary first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Address> {
        let addrs = self.addrs.read().unwrap_or_else(PoisonError::into_inner);
        sorted(&addrs)
    }

    /// Address IDs, primary first.
    #[must_use]
    pub fn ids(&self) -> Vec<AddressId> {
        self.snapshot().into_iter().map(|addr| addr.id).collect()
    }

    /// Email addresses, primary first.
    #[must_use]
    pub fn emails(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|addr| addr.email).collect()
    }

    /// The primary address, if the account has any address at all.
    #[must_use]
    pub fn primary(&self) -> Option<Address> {
        self.nth(0)
    }

    /// The address at the given position in ordinal order.
    #[must_use]
    pub fn nth(&self, index: usize) -> Option<Address> {
        self.snapshot().into_iter().nth(index)
    }

    /// Look up an address by ID.
    #[must_use]
    pub fn get(&self, id: &AddressId) -> Option<Address> {
        self.addrs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Look up an address by email, ignoring case.
    #[must_use]
    pub fn by_email(&self, email: &str) -> Option<Address> {
        let email = email.to_lowercase();
        self.addrs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|addr| addr.email.to_lowercase() == email)
            .cloned()
    }

    /// Whether any address has exactly this email.
    #[must_use]
    pub fn has_email(&self, email: &str) -> bool {
        self.addrs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|addr| addr.email == email)
    }

    /// Whether the address ID is known.
    #[must_use]
    pub fn contains(&self, id: &AddressId) -> bool {
        self.addrs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Number of addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.addrs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the account has no addresses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a new address. Returns false if the ID was already present.
    pub fn insert(&self, addr: Address) -> bool {
        let mut addrs = self.addrs.write().unwrap_or_else(PoisonError::into_inner);
        if addrs.contains_key(&addr.id) {
            return false;
        }
        addrs.insert(addr.id.clone(), addr);
        true
    }

    /// Replace an existing address record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the address is unknown.
    pub fn update(&self, addr: Address) -> Result<Address> {
        let mut addrs = self.addrs.write().unwrap_or_else(PoisonError::into_inner);
        match addrs.get_mut(&addr.id) {
            Some(existing) => Ok(std::mem::replace(existing, addr)),
            None => Err(Error::NotFound(format!("address {}", addr.id))),
        }
    }

    /// Remove an address.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the address is unknown.
    pub fn remove(&self, id: &AddressId) -> Result<Address> {
        self.addrs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("address {id}")))
    }
}

fn index(addrs: Vec<Address>) -> HashMap<AddressId, Address> {
    addrs.into_iter().map(|addr| (addr.id.clone(), addr)).collect()
}

/// Orders by ordinal, then by ID so ties are deterministic.
fn sorted(addrs: &HashMap<AddressId, Address>) -> Vec<Address> {
    let mut list: Vec<Address> = addrs.values().cloned().collect();
    list.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
    list
}
