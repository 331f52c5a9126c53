use crate::*;

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use serde::{Serialize,Deserialize};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::{Builder, Runtime},
    select,
    sync::mpsc::{
        UnboundedSender,
        UnboundedReceiver,
        unbounded_channel,
    },
};

/// How long to pause accepting after the process runs out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn default_address() -> IpAddr { IpAddr::V4(Ipv4Addr::UNSPECIFIED) }

/// Where an [`Acceptor`] listens
#[derive(Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub struct ListenerConfig
{
    #[serde(default="default_address")]
    pub address: IpAddr,
    pub port: u16,
}

impl ListenerConfig
{
    /// Listen on all interfaces on the given port
    pub fn new(port: u16) -> Self
    {
        Self { address: default_address(), port }
    }

    pub fn socket_addr(&self) -> SocketAddr
    {
        SocketAddr::new(self.address, self.port)
    }
}

#[derive(PartialEq,Eq,Clone,Copy,Debug)]
pub enum AcceptorState
{
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// An acceptor's lifecycle state, shared with its accept thread
struct SharedState
{
    state: Mutex<AcceptorState>,
    stopped: Condvar,
}

impl SharedState
{
    fn new() -> Self
    {
        Self {
            state: Mutex::new(AcceptorState::NotStarted),
            stopped: Condvar::new(),
        }
    }

    fn get(&self) -> AcceptorState
    {
        *self.state.lock()
    }

    fn set_stopped(&self)
    {
        *self.state.lock() = AcceptorState::Stopped;
        self.stopped.notify_all();
    }

    /// Block while an accept thread is running
    fn wait_stopped(&self)
    {
        let mut state = self.state.lock();
        while matches!(*state, AcceptorState::Running | AcceptorState::Stopping)
        {
            self.stopped.wait(&mut state);
        }
    }
}

/// Marks the acceptor stopped when the accept thread exits, including by panic
struct StoppedOnExit(Arc<SharedState>);

impl Drop for StoppedOnExit
{
    fn drop(&mut self)
    {
        self.0.set_stopped();
    }
}

/// Where the accept loop gets its connections from
#[async_trait]
trait Incoming: Send + Sync
{
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Incoming for TcpListener
{
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>
    {
        TcpListener::accept(self).await
    }
}

#[derive(Debug)]
enum AcceptorControl
{
    Close,
}

#[derive(Default)]
struct AcceptorHandles
{
    control: Option<UnboundedSender<AcceptorControl>>,
    thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// Owns a listening socket and the thread that accepts connections on it.
///
/// Each accepted socket is wrapped in a [`ConnectContext`] and submitted to the
/// configured [`ConnectScheduler`]; contexts the scheduler rejects are closed
/// here. An acceptor runs at most once: after `stop()`, a new instance is
/// needed to listen again.
pub struct Acceptor
{
    id: ListenerId,
    config: ListenerConfig,
    scheduler: Option<Arc<dyn ConnectScheduler>>,
    shared: Arc<SharedState>,
    handles: Mutex<AcceptorHandles>,
}

impl Acceptor
{
    pub fn new(port: u16, scheduler: Option<Arc<dyn ConnectScheduler>>) -> Self
    {
        Self::with_config(ListenerConfig::new(port), scheduler)
    }

    pub fn with_config(config: ListenerConfig, scheduler: Option<Arc<dyn ConnectScheduler>>) -> Self
    {
        Self {
            id: ListenerId::next(),
            config,
            scheduler,
            shared: Arc::new(SharedState::new()),
            handles: Mutex::new(AcceptorHandles::default()),
        }
    }

    pub fn id(&self) -> ListenerId
    {
        self.id
    }

    pub fn config(&self) -> &ListenerConfig
    {
        &self.config
    }

    pub fn state(&self) -> AcceptorState
    {
        self.shared.get()
    }

    pub fn is_running(&self) -> bool
    {
        self.state() == AcceptorState::Running
    }

    /// The address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr>
    {
        self.handles.lock().local_addr
    }

    /// Bind the listening socket and start the accept thread.
    ///
    /// Returns `true` once the socket is bound; the accept thread may not have
    /// run yet. Returns `false`, leaving this acceptor as it was, if there is no
    /// scheduler, the address can't be bound, or this acceptor has already been
    /// started.
    pub fn start(&self) -> bool
    {
        match self.try_start()
        {
            Ok(addr) => {
                tracing::info!("Listener {} accepting connections on {}", self.id, addr);
                true
            }
            Err(e) => {
                tracing::error!("Listener {} failed to start: {}", self.id, e);
                false
            }
        }
    }

    fn try_start(&self) -> Result<SocketAddr, ListenerError>
    {
        let scheduler = self.scheduler.clone().ok_or(ListenerError::NoScheduler)?;

        let mut handles = self.handles.lock();
        let mut state = self.shared.state.lock();

        match *state
        {
            AcceptorState::NotStarted => (),
            AcceptorState::Running | AcceptorState::Stopping => return Err(ListenerError::AlreadyStarted),
            AcceptorState::Stopped => return Err(ListenerError::Stopped),
        }

        let address = self.config.socket_addr();
        let listener = std::net::TcpListener::bind(address).map_err(|e| ListenerError::Bind(address, e))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (control_send, control_recv) = unbounded_channel();

        let id = self.id;
        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
                        .name(format!("acceptor-{}", local_addr.port()))
                        .spawn(move || {
                            Self::accept_thread(id, runtime, move || TcpListener::from_std(listener),
                                                control_recv, scheduler, shared)
                        })?;

        // The thread can't report its own exit until we release the state lock, so this
        // can't overwrite a Stopped
        *state = AcceptorState::Running;
        handles.control = Some(control_send);
        handles.thread = Some(thread);
        handles.local_addr = Some(local_addr);

        Ok(local_addr)
    }

    /// Tell the accept thread to exit.
    ///
    /// This doesn't wait: the thread closes the listening socket when it sees the
    /// request, which has happened by the time `join()` returns. Sessions already
    /// admitted are unaffected. Calling this more than once, or on an acceptor
    /// that never started, does nothing.
    pub fn stop(&self)
    {
        let mut handles = self.handles.lock();
        let mut state = self.shared.state.lock();

        if *state == AcceptorState::Running
        {
            *state = AcceptorState::Stopping;
            tracing::info!("Stopping listener {}", self.id);
        }

        if let Some(control) = handles.control.take()
        {
            // A send error means the thread has already gone, which is what we want anyway
            let _ = control.send(AcceptorControl::Close);
        }
    }

    /// Wait for the accept thread to exit.
    ///
    /// Returns immediately if it was never started. Without a preceding
    /// `stop()`, this waits until the loop ends on its own. Any number of
    /// callers may wait at once; none returns before the thread has finished.
    pub fn join(&self)
    {
        let thread = self.handles.lock().thread.take();

        if let Some(thread) = thread
        {
            if thread.join().is_err()
            {
                tracing::error!("Accept thread for listener {} panicked", self.id);
            }
        }

        self.shared.wait_stopped();
    }

    /// Body of the accept thread. `bind` runs inside `runtime`, so it can
    /// register the socket with that runtime's reactor.
    fn accept_thread<I, B>(id: ListenerId,
                           runtime: Runtime,
                           bind: B,
                           control: UnboundedReceiver<AcceptorControl>,
                           scheduler: Arc<dyn ConnectScheduler>,
                           shared: Arc<SharedState>)
        where I: Incoming, B: FnOnce() -> io::Result<I>
    {
        let _stopped = StoppedOnExit(shared);
        // Everything else the thread owns is released inside here, before it reports Stopped
        Self::run_accept_loop(id, runtime, bind, control, scheduler);
    }

    fn run_accept_loop<I, B>(id: ListenerId,
                             runtime: Runtime,
                             bind: B,
                             control: UnboundedReceiver<AcceptorControl>,
                             scheduler: Arc<dyn ConnectScheduler>)
        where I: Incoming, B: FnOnce() -> io::Result<I>
    {
        // The scheduler is only lent to the loop, so the last reference to it is never
        // dropped from inside the runtime
        let scheduler = scheduler.as_ref();
        let result = runtime.block_on(async move {
            let incoming = bind()?;
            Self::accept_loop(id, &incoming, control, scheduler).await
        });

        match result
        {
            Ok(()) => tracing::debug!("Listener {} closed", id),
            Err(e) => tracing::error!("Listener {} failed: {}", id, e),
        }
    }

    async fn accept_loop(id: ListenerId,
                         incoming: &impl Incoming,
                         mut control: UnboundedReceiver<AcceptorControl>,
                         scheduler: &dyn ConnectScheduler) -> Result<(), ListenerError>
    {
        let id_gen = ConnectionIdGenerator::new(id, 1);

        loop
        {
            select! {
                biased;

                control = control.recv() => {
                    match control {
                        None => break,
                        Some(AcceptorControl::Close) => break,
                    }
                },
                res = incoming.accept() => {
                    match res {
                        Ok((stream, peer)) => {
                            Self::dispatch(scheduler, id_gen.next(), stream, peer);
                        }
                        Err(e) => match AcceptFailure::classify(&e) {
                            AcceptFailure::Transient => {
                                tracing::warn!("Listener {}: transient accept error: {}", id, e);
                            }
                            AcceptFailure::Exhausted => {
                                tracing::warn!("Listener {}: out of resources accepting connection: {}", id, e);
                                tokio::time::sleep(ACCEPT_BACKOFF).await;
                            }
                            AcceptFailure::Fatal => {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn dispatch(scheduler: &dyn ConnectScheduler, conn_id: ConnectionId, stream: TcpStream, peer: SocketAddr)
    {
        let stream = match stream.into_std()
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Couldn't detach connection {} from {}: {}", conn_id, peer, e);
                return;
            }
        };

        tracing::trace!("Accepted connection {} from {}", conn_id, peer);

        let context = ConnectContext::new(conn_id, stream, peer);
        if let Err(mut rejected) = scheduler.submit(context)
        {
            tracing::debug!("Connection {} from {} rejected", conn_id, peer);
            rejected.close();
        }
    }
}

impl Drop for Acceptor
{
    fn drop(&mut self)
    {
        self.stop();
        self.join();
    }
}

/// What the accept loop should do about a failed `accept()`
#[derive(PartialEq,Eq,Debug)]
enum AcceptFailure
{
    /// Problem with one incoming connection; carry on
    Transient,
    /// Out of descriptors or memory; back off, then carry on
    Exhausted,
    /// The listening socket itself is broken
    Fatal,
}

impl AcceptFailure
{
    fn classify(e: &io::Error) -> Self
    {
        use io::ErrorKind::*;

        match e.kind()
        {
            ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut => return Self::Transient,
            _ => ()
        }

        match e.raw_os_error()
        {
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM) => Self::Exhausted,
            // Network errors on the pending connection, which accept(2) reports in place of the connection
            Some(libc::EPROTO) | Some(libc::ENOPROTOOPT) | Some(libc::ENETDOWN) | Some(libc::ENETUNREACH)
                | Some(libc::EHOSTDOWN) | Some(libc::EHOSTUNREACH) | Some(libc::EOPNOTSUPP) => Self::Transient,
            _ => Self::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails `transient` times with a per-connection error, then with a broken socket
    struct FailingSocket {
        transient: usize,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Incoming for FailingSocket {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.transient {
                Err(io::Error::from(io::ErrorKind::ConnectionAborted))
            } else {
                Err(io::Error::from_raw_os_error(libc::EBADF))
            }
        }
    }

    struct RefuseAll;

    impl ConnectScheduler for RefuseAll {
        fn submit(&self, context: ConnectContext) -> Result<(), ConnectContext> {
            Err(context)
        }
    }

    fn run_on(acceptor: &Acceptor, socket: FailingSocket) {
        *acceptor.shared.state.lock() = AcceptorState::Running;

        let runtime = Builder::new_current_thread().enable_all().build().unwrap();
        let (_control, control_recv) = unbounded_channel();

        Acceptor::accept_thread(acceptor.id(), runtime, move || Ok(socket), control_recv,
                                Arc::new(RefuseAll), Arc::clone(&acceptor.shared));
    }

    #[test]
    fn fatal_accept_error_stops_the_acceptor() {
        let acceptor = Acceptor::new(0, None);
        let attempts = Arc::new(AtomicUsize::new(0));

        run_on(&acceptor, FailingSocket { transient: 3, attempts: Arc::clone(&attempts) });

        // Transient failures are skipped; the first fatal one ends the loop
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(acceptor.state(), AcceptorState::Stopped);
        assert!(!acceptor.is_running());

        // Nothing left to wait for
        acceptor.join();
    }

    #[test]
    fn failed_bind_stops_the_acceptor() {
        let acceptor = Acceptor::new(0, None);
        *acceptor.shared.state.lock() = AcceptorState::Running;

        let runtime = Builder::new_current_thread().enable_all().build().unwrap();
        let (_control, control_recv) = unbounded_channel();
        let bind = || -> io::Result<FailingSocket> { Err(io::Error::from(io::ErrorKind::AddrInUse)) };

        Acceptor::accept_thread(acceptor.id(), runtime, bind, control_recv,
                                Arc::new(RefuseAll), Arc::clone(&acceptor.shared));

        assert_eq!(acceptor.state(), AcceptorState::Stopped);
    }

    #[test]
    fn classify_accept_errors() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(AcceptFailure::classify(&aborted), AcceptFailure::Transient);

        let emfile = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(AcceptFailure::classify(&emfile), AcceptFailure::Exhausted);

        let eproto = io::Error::from_raw_os_error(libc::EPROTO);
        assert_eq!(AcceptFailure::classify(&eproto), AcceptFailure::Transient);

        let ebadf = io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(AcceptFailure::classify(&ebadf), AcceptFailure::Fatal);

        let einval = io::Error::from_raw_os_error(libc::EINVAL);
        assert_eq!(AcceptFailure::classify(&einval), AcceptFailure::Fatal);
    }

    #[test]
    fn default_listener_config() {
        let config = ListenerConfig::new(9030);
        assert_eq!(config.socket_addr(), "0.0.0.0:9030".parse::<SocketAddr>().unwrap());

        let parsed: ListenerConfig = serde_json::from_str(r#"{ "port": 9031 }"#).unwrap();
        assert_eq!(parsed, ListenerConfig::new(9031));
    }

    #[test]
    fn never_started() {
        let acceptor = Acceptor::new(0, None);

        assert_eq!(acceptor.state(), AcceptorState::NotStarted);
        assert!(!acceptor.start());
        assert_eq!(acceptor.state(), AcceptorState::NotStarted);
        assert!(acceptor.local_addr().is_none());

        acceptor.stop();
        acceptor.join();
        assert_eq!(acceptor.state(), AcceptorState::NotStarted);
    }
}
