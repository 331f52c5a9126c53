use crate::*;

use async_trait::async_trait;
use serde::{Serialize,Deserialize};
use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    runtime::{Builder, Handle, Runtime},
    select,
};

/// Decides whether an accepted connection may proceed.
///
/// `submit` must be callable from several acceptor threads at once, must not
/// wait for session processing, and must never panic.
///
/// `Ok(())` means the scheduler has taken ownership of the context and will
/// release it when the session ends. `Err(context)` is a rejection: the
/// scheduler has done nothing with the context and hands it back untouched, and
/// closing it is the caller's responsibility.
pub trait ConnectScheduler: Send + Sync
{
    fn submit(&self, context: ConnectContext) -> Result<(), ConnectContext>;
}

/// Processes an admitted connection: protocol handshake, authentication and
/// command dispatch all happen behind this trait.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static
{
    async fn handle(&self, session: &mut Session) -> Result<(), SessionError>;
}

/// An admitted connection, as seen by a [`SessionHandler`].
pub struct Session
{
    context: ConnectContext,
    stream: TcpStream,
}

impl Session
{
    pub fn id(&self) -> ConnectionId
    {
        self.context.id()
    }

    pub fn remote_addr(&self) -> SocketAddr
    {
        self.context.remote_addr()
    }

    pub fn context(&self) -> &ConnectContext
    {
        &self.context
    }

    pub fn stream(&mut self) -> &mut TcpStream
    {
        &mut self.stream
    }
}

fn default_worker_threads() -> usize { 8 }

/// How long a scheduler dropped without `shutdown` gives killed sessions to finish
const DROP_GRACE: Duration = Duration::from_secs(1);

/// Settings for a [`ConnectionScheduler`]
#[derive(Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
#[serde(rename_all="snake_case")]
pub struct SchedulerConfig
{
    /// Number of worker threads executing admitted sessions
    #[serde(default="default_worker_threads")]
    pub worker_threads: usize,
    #[serde(flatten)]
    pub limits: AdmissionLimits,
}

impl Default for SchedulerConfig
{
    fn default() -> Self
    {
        Self {
            worker_threads: default_worker_threads(),
            limits: AdmissionLimits::default(),
        }
    }
}

/// The standard [`ConnectScheduler`].
///
/// Admission is checked against an [`AdmissionControl`]; admitted sessions are
/// registered in a [`SessionRegistry`] and run as tasks on a worker runtime
/// owned by the scheduler.
///
/// Shutting down, or dropping, a scheduler never blocks on the runtime itself,
/// so either may happen from inside another tokio runtime.
pub struct ConnectionScheduler
{
    admission: Arc<AdmissionControl>,
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn SessionHandler>,
    workers: Handle,
    runtime: Option<Runtime>,
}

impl ConnectionScheduler
{
    pub fn new(config: SchedulerConfig, handler: Arc<dyn SessionHandler>) -> std::io::Result<Self>
    {
        let runtime = Builder::new_multi_thread()
                        .worker_threads(config.worker_threads.max(1))
                        .thread_name("frontend-worker")
                        .enable_all()
                        .build()?;

        Ok(Self {
            admission: AdmissionControl::new(config.limits),
            registry: Arc::new(SessionRegistry::new()),
            handler,
            workers: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub fn limits(&self) -> AdmissionLimits
    {
        self.admission.limits()
    }

    /// Number of sessions currently admitted
    pub fn connection_count(&self) -> usize
    {
        self.admission.admitted()
    }

    /// Live admitted sessions, in connection ID order
    pub fn list_connections(&self) -> Vec<SessionInfo>
    {
        self.registry.list()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<SessionInfo>
    {
        self.registry.get(id)
    }

    /// End an admitted session. Returns `false` if `id` isn't a live session.
    pub fn kill(&self, id: ConnectionId) -> bool
    {
        let found = self.registry.kill(id);
        if found
        {
            tracing::info!("Killing connection {}", id);
        }
        found
    }

    /// Kill every live session and stop the worker runtime, waiting up to
    /// `timeout` for killed sessions to release their slots.
    pub fn shutdown(mut self, timeout: Duration)
    {
        self.stop_workers(timeout);
    }

    fn stop_workers(&mut self, timeout: Duration)
    {
        let runtime = match self.runtime.take()
        {
            Some(runtime) => runtime,
            None => return,
        };

        tracing::info!("Scheduler shutting down with {} live sessions", self.registry.len());
        self.registry.kill_all();

        // Sessions run on our own workers, so waiting here only blocks the caller
        if !self.admission.wait_idle(timeout)
        {
            tracing::warn!("{} sessions still running after {:?}; abandoning them",
                           self.admission.admitted(), timeout);
        }

        runtime.shutdown_background();
    }
}

impl Drop for ConnectionScheduler
{
    fn drop(&mut self)
    {
        self.stop_workers(DROP_GRACE);
    }
}

impl ConnectScheduler for ConnectionScheduler
{
    fn submit(&self, mut context: ConnectContext) -> Result<(), ConnectContext>
    {
        let peer = context.remote_addr();

        let permit = match self.admission.try_acquire(peer.ip())
        {
            Some(permit) => permit,
            None => {
                tracing::debug!("Rejecting connection {} from {}: {} sessions admitted",
                                context.id(), peer, self.admission.admitted());
                return Err(context);
            }
        };

        context.set_state(SessionState::Admitted);
        let entry = self.registry.register(context.info());

        tracing::trace!("Admitted connection {} from {}", context.id(), peer);

        let task = SessionTask {
            handler: Arc::clone(&self.handler),
            entry,
            permit,
        };
        self.workers.spawn(task.run(context));

        Ok(())
    }
}

/// A single admitted session running on a worker.
///
/// The registry entry and admission permit are released when this is dropped,
/// which happens exactly once whether the handler returns, fails, panics or is
/// killed. Fields drop in order, so a session leaves the registry before its
/// admission slot is freed.
struct SessionTask
{
    handler: Arc<dyn SessionHandler>,
    entry: RegistryEntry,
    permit: AdmissionPermit,
}

impl SessionTask
{
    async fn run(self, context: ConnectContext)
    {
        let id = context.id();

        match self.serve(context).await
        {
            Ok(()) => tracing::debug!("Connection {} finished", id),
            Err(SessionError::Killed) => tracing::info!("Connection {} killed", id),
            Err(SessionError::Closed) => tracing::debug!("Connection {} closed by peer", id),
            Err(e) => tracing::warn!("Connection {} ended with error: {}", id, e),
        }

        tracing::trace!("Releasing admission slot for {} ({})", id, self.permit.peer());
    }

    async fn serve(&self, mut context: ConnectContext) -> Result<(), SessionError>
    {
        let stream = context.take_stream().ok_or(SessionError::Closed)?;
        // Sockets arrive from another runtime's reactor, and must be non-blocking to register with ours
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream)?;

        context.set_state(SessionState::Active);
        self.entry.set_state(SessionState::Active);

        let mut session = Session { context, stream };

        let result = select! {
            res = self.handler.handle(&mut session) => res,
            _ = self.entry.killed() => Err(SessionError::Killed),
        };

        // Best effort; dropping the stream releases the fd regardless
        let _ = session.stream.shutdown().await;
        session.context.close();

        result
    }
}
