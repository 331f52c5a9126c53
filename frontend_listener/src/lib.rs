//! The client connection front door of the query frontend.
//!
//! An [`Acceptor`] owns a listening socket and runs its accept loop on a
//! dedicated thread. Every accepted socket becomes a [`ConnectContext`], which
//! is offered to a [`ConnectScheduler`]; the scheduler either takes ownership
//! and runs the session on a worker, or hands the context back to be closed.
//!
//! [`ConnectionScheduler`] is the standard scheduler: it enforces
//! [`AdmissionLimits`], keeps a [`SessionRegistry`] of live sessions, and runs
//! each admitted session through a host-supplied [`SessionHandler`].

pub mod id;
pub use id::*;

pub mod error;
pub use error::*;

mod context;
pub use context::*;

mod admission;
pub use admission::*;

mod registry;
pub use registry::*;

mod scheduler;
pub use scheduler::*;

mod acceptor;
pub use acceptor::*;
