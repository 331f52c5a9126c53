use crate::*;

use chrono::{DateTime, Utc};
use serde::{Serialize,Deserialize};
use std::net::{
    Shutdown,
    SocketAddr,
    TcpStream,
};

/// Lifecycle of a single client connection
#[derive(PartialEq,Eq,Clone,Copy,Debug,Serialize,Deserialize)]
#[serde(rename_all="lowercase")]
pub enum SessionState
{
    /// Accepted, not yet submitted to a scheduler
    New,
    /// Admitted by the scheduler and queued for a worker
    Admitted,
    /// Being processed by a worker
    Active,
    /// Socket released
    Closed,
}

/// A snapshot of a connection's identity and state, as listed by the scheduler.
#[derive(Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub struct SessionInfo
{
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub created: DateTime<Utc>,
    pub state: SessionState,
}

/// Per-connection state created by the acceptor for each accepted socket.
///
/// A context has exactly one owner at a time. The acceptor owns it until it is
/// passed to [`ConnectScheduler::submit`]; an admitted context belongs to the
/// scheduler from then on, and a rejected one is handed back to the acceptor,
/// which closes it.
#[derive(Debug)]
pub struct ConnectContext
{
    id: ConnectionId,
    remote_addr: SocketAddr,
    created: DateTime<Utc>,
    state: SessionState,
    stream: Option<TcpStream>,
}

impl ConnectContext
{
    pub fn new(id: ConnectionId, stream: TcpStream, remote_addr: SocketAddr) -> Self
    {
        Self {
            id,
            remote_addr,
            created: Utc::now(),
            state: SessionState::New,
            stream: Some(stream),
        }
    }

    pub fn id(&self) -> ConnectionId
    {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr
    {
        self.remote_addr
    }

    pub fn created(&self) -> DateTime<Utc>
    {
        self.created
    }

    pub fn state(&self) -> SessionState
    {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState)
    {
        self.state = state;
    }

    /// Does this context still hold its socket?
    pub fn is_closed(&self) -> bool
    {
        self.stream.is_none()
    }

    /// Move the socket out, leaving the context without one. Used by the worker
    /// when it takes over the connection.
    pub(crate) fn take_stream(&mut self) -> Option<TcpStream>
    {
        self.stream.take()
    }

    pub fn info(&self) -> SessionInfo
    {
        SessionInfo {
            id: self.id,
            remote_addr: self.remote_addr,
            created: self.created,
            state: self.state,
        }
    }

    /// Close the connection. Only the first call touches the socket.
    pub fn close(&mut self)
    {
        if let Some(stream) = self.stream.take()
        {
            tracing::trace!("Closing connection {}", self.id);
            // The peer may already have gone; all we care about is that the fd is released
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for ConnectContext
{
    fn drop(&mut self)
    {
        self.close();
    }
}
