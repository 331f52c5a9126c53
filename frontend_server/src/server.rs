use crate::config::ServerConfig;

use frontend_listener::{
    Acceptor,
    AcceptorState,
    ConnectScheduler,
    ConnectionScheduler,
    SessionHandler,
};
use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

/// A query frontend's client listener, assembled from a [`ServerConfig`].
///
/// Combines a [`ConnectionScheduler`] running the supplied [`SessionHandler`]
/// with an [`Acceptor`] feeding it. `start`, `stop` and `join` follow the
/// acceptor's lifecycle; admitted sessions outlive `stop` and are only ended
/// by [`shutdown`](Self::shutdown).
pub struct FrontendServer
{
    scheduler: Arc<ConnectionScheduler>,
    acceptor: Acceptor,
}

impl FrontendServer
{
    pub fn new(config: &ServerConfig, handler: Arc<dyn SessionHandler>) -> std::io::Result<Self>
    {
        let scheduler = Arc::new(ConnectionScheduler::new(config.scheduler.clone(), handler)?);
        let acceptor = Acceptor::with_config(
            config.listener.clone(),
            Some(Arc::clone(&scheduler) as Arc<dyn ConnectScheduler>)
        );

        Ok(Self { scheduler, acceptor })
    }

    pub fn start(&self) -> bool
    {
        self.acceptor.start()
    }

    pub fn stop(&self)
    {
        self.acceptor.stop()
    }

    pub fn join(&self)
    {
        self.acceptor.join()
    }

    pub fn state(&self) -> AcceptorState
    {
        self.acceptor.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr>
    {
        self.acceptor.local_addr()
    }

    pub fn scheduler(&self) -> &ConnectionScheduler
    {
        &self.scheduler
    }

    /// Stop accepting, wait for the accept thread, then end every live session,
    /// giving workers up to `timeout` to finish.
    pub fn shutdown(self, timeout: Duration)
    {
        let Self { scheduler, acceptor } = self;

        acceptor.stop();
        acceptor.join();
        // The acceptor holds the other reference to the scheduler
        drop(acceptor);

        match Arc::try_unwrap(scheduler)
        {
            Ok(scheduler) => scheduler.shutdown(timeout),
            Err(scheduler) => {
                tracing::warn!("Scheduler still shared at shutdown; killing {} sessions without stopping workers",
                               scheduler.connection_count());
                for session in scheduler.list_connections()
                {
                    scheduler.kill(session.id);
                }
            }
        }
    }
}
