//! Host-side wiring for the frontend connection listener: configuration
//! loading, log subscriber construction, and assembly of a scheduler and
//! acceptor into a [`FrontendServer`].

pub mod config;

mod server;
pub use server::*;

mod tracing_config;

pub use tracing_config::build_subscriber;
