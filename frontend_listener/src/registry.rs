use crate::*;

use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::Arc,
};
use tokio::sync::Notify;

/// The admitted sessions known to a scheduler, keyed by connection ID.
///
/// Used to list live sessions and to ask a session's worker to terminate.
#[derive(Debug,Default)]
pub struct SessionRegistry
{
    sessions: Mutex<BTreeMap<ConnectionId, RegisteredSession>>,
}

#[derive(Debug)]
struct RegisteredSession
{
    info: SessionInfo,
    kill: Arc<Notify>,
}

/// Keeps a session listed in its [`SessionRegistry`] for as long as it lives
#[derive(Debug)]
pub(crate) struct RegistryEntry
{
    registry: Arc<SessionRegistry>,
    id: ConnectionId,
    kill: Arc<Notify>,
}

impl SessionRegistry
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub(crate) fn register(self: &Arc<Self>, info: SessionInfo) -> RegistryEntry
    {
        let id = info.id;
        let kill = Arc::new(Notify::new());

        self.sessions.lock().insert(id, RegisteredSession { info, kill: Arc::clone(&kill) });

        RegistryEntry {
            registry: Arc::clone(self),
            id,
            kill,
        }
    }

    fn unregister(&self, id: ConnectionId)
    {
        self.sessions.lock().remove(&id);
    }

    fn set_state(&self, id: ConnectionId, state: SessionState)
    {
        if let Some(session) = self.sessions.lock().get_mut(&id)
        {
            session.info.state = state;
        }
    }

    /// Ask the worker serving `id` to end the session.
    ///
    /// Returns `false` if no such session is registered.
    pub fn kill(&self, id: ConnectionId) -> bool
    {
        match self.sessions.lock().get(&id)
        {
            Some(session) => {
                // notify_one stores a permit, so a worker that hasn't started waiting yet still sees it
                session.kill.notify_one();
                true
            }
            None => false
        }
    }

    /// Ask every registered session to end
    pub fn kill_all(&self)
    {
        for session in self.sessions.lock().values()
        {
            session.kill.notify_one();
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<SessionInfo>
    {
        self.sessions.lock().get(&id).map(|s| s.info.clone())
    }

    /// Snapshot of all registered sessions, in connection ID order
    pub fn list(&self) -> Vec<SessionInfo>
    {
        self.sessions.lock().values().map(|s| s.info.clone()).collect()
    }

    pub fn len(&self) -> usize
    {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }
}

impl RegistryEntry
{
    pub fn set_state(&self, state: SessionState)
    {
        self.registry.set_state(self.id, state);
    }

    /// Resolves once the session has been killed
    pub async fn killed(&self)
    {
        self.kill.notified().await
    }
}

impl Drop for RegistryEntry
{
    fn drop(&mut self)
    {
        self.registry.unregister(self.id);
    }
}
