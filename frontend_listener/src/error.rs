use thiserror::Error;
use std::net::SocketAddr;

/// An error that might occur while starting or running an [`Acceptor`](crate::Acceptor).
///
/// These never escape `Acceptor::start()`, which reports failure as `false`;
/// they exist so the failure can be logged with its cause.
#[derive(Error,Debug)]
pub enum ListenerError
{
    #[error("No connection scheduler configured")]
    NoScheduler,
    #[error("Listener already started")]
    AlreadyStarted,
    #[error("Listener has been stopped and cannot be restarted")]
    Stopped,
    #[error("Unable to bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),
    #[error("I/O Error: {0}")]
    IoError(#[from] std::io::Error),
}

/// An error that might end a single admitted session.
#[derive(Error,Debug)]
pub enum SessionError
{
    #[error("Connection closed")]
    Closed,
    #[error("Session killed")]
    Killed,
    #[error("I/O Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Session handler error: {0}")]
    Handler(#[from] anyhow::Error),
}
