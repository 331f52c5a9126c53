use serde::{Serialize,Deserialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Identifies a single [`Acceptor`](crate::Acceptor) within this process.
#[derive(PartialEq,Eq,PartialOrd,Ord,Hash,Debug,Clone,Copy,Serialize,Deserialize)]
pub struct ListenerId(i64);

/// Identifies a single accepted connection.
///
/// The listener component keeps IDs unique when several acceptors feed the
/// same scheduler; the serial is assigned sequentially by the owning acceptor.
#[derive(PartialEq,Eq,PartialOrd,Ord,Hash,Debug,Clone,Copy,Serialize,Deserialize)]
pub struct ConnectionId(ListenerId, i64);

impl ListenerId
{
    pub const fn new(id: i64) -> Self { Self(id) }

    /// Allocate a listener ID that has not been handed out before in this process
    pub fn next() -> Self
    {
        LISTENER_IDS.next()
    }

    pub fn value(&self) -> i64 { self.0 }
}

impl ConnectionId
{
    pub const fn new(listener: ListenerId, serial: i64) -> Self { Self(listener, serial) }

    pub fn listener(&self) -> ListenerId { self.0 }

    pub fn serial(&self) -> i64 { self.1 }
}

impl fmt::Display for ListenerId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConnectionId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}:{}", self.0, self.1)
    }
}

static LISTENER_IDS: ListenerIdGenerator = ListenerIdGenerator::new(1);

/// Hands out sequential [`ListenerId`]s
#[derive(Debug)]
pub struct ListenerIdGenerator(AtomicI64);

impl ListenerIdGenerator
{
    pub const fn new(start: i64) -> Self
    {
        Self(AtomicI64::new(start))
    }

    pub fn next(&self) -> ListenerId
    {
        ListenerId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Hands out sequential [`ConnectionId`]s belonging to a single listener
#[derive(Debug)]
pub struct ConnectionIdGenerator
{
    listener: ListenerId,
    serial: AtomicI64,
}

impl ConnectionIdGenerator
{
    pub fn new(listener: ListenerId, start: i64) -> Self
    {
        Self {
            listener,
            serial: AtomicI64::new(start),
        }
    }

    pub fn next(&self) -> ConnectionId
    {
        ConnectionId(self.listener, self.serial.fetch_add(1, Ordering::Relaxed))
    }
}
