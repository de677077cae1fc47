//! Account model types.

use serde::{Deserialize, Serialize};

/// Declares a string-backed identifier newtype.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

pub(crate) use string_id;

string_id! {
    /// Remote identifier of an account.
    UserId
}

string_id! {
    /// Remote identifier of one of an account's addresses.
    AddressId
}

/// Snapshot of the remote account, replaced wholesale when refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    /// Remote account ID.
    pub id: UserId,
    /// Account username.
    pub name: String,
    /// Bytes used on the remote side.
    pub used_space: u64,
    /// Bytes available on the remote side.
    pub max_space: u64,
}

/// One address of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Remote address ID.
    pub id: AddressId,
    /// Email address.
    pub email: String,
    /// Ordinal; the lowest one is the primary address.
    pub order: u32,
    /// Whether the address can send and receive mail.
    pub enabled: bool,
}

impl Address {
    /// Create an enabled address.
    #[must_use]
    pub fn new(id: impl Into<String>, email: impl Into<String>, order: u32) -> Self {
        Self {
            id: AddressId::new(id),
            email: email.into(),
            order,
            enabled: true,
        }
    }
}

/// How an account's addresses map onto exposed mailbox namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressMode {
    /// All addresses share one namespace, bound to the primary address.
    #[default]
    Combined,
    /// Each address has its own namespace.
    Split,
}

impl AddressMode {
    /// Storage representation of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Combined => "combined",
            Self::Split => "split",
        }
    }

    /// Parse the storage representation, falling back to combined.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "split" => Self::Split,
            _ => Self::Combined,
        }
    }
}

impl std::fmt::Display for AddressMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
