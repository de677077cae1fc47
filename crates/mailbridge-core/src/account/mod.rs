//! Account identity and address management.

mod directory;
mod model;

pub use directory::AddressDirectory;
pub use model::{AccountIdentity, Address, AddressId, AddressMode, UserId};
pub(crate) use model::string_id;
