//! Fleet-level coordination of logged-in accounts.
//!
//! The [`AccountRegistry`] owns every [`UserSession`](crate::session::UserSession)
//! and its protocol-server registrations. An [`EventDispatcher`] per account
//! reacts to the session's lifecycle events: it provisions and deprovisions
//! registrations, repairs or logs out accounts whose event stream went bad,
//! and reports failures through a [`Reporter`].

mod dispatcher;
mod policy;
mod registry;
mod reporter;

pub use dispatcher::EventDispatcher;
pub use policy::BadEventPolicy;
pub use registry::{AccountNotice, AccountRegistry};
pub use reporter::{ReportContext, Reporter, TracingReporter};
