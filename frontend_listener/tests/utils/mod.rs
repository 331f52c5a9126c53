#![allow(dead_code)]

use frontend_listener::*;

use std::{
    io::Read,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

pub const WAIT: Duration = Duration::from_secs(10);

/// Find a port that nothing is listening on, by binding to port 0 and letting it go again
pub fn free_port() -> u16 {
    let socket = TcpListener::bind("0.0.0.0:0").unwrap();
    socket.local_addr().unwrap().port()
}

pub fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Poll `cond` until it holds or `WAIT` passes
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Read from `stream` until the peer closes it. Returns true if it did so within `WAIT`.
pub fn closed_by_peer(stream: &mut TcpStream) -> bool {
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) => {
                return matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
                )
            }
        }
    }
}

/// Build `count` contexts over real loopback connections. The client ends are
/// returned alongside so the sockets stay open for as long as the test needs.
pub fn loopback_contexts(count: usize) -> Vec<(ConnectContext, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let id_gen = ConnectionIdGenerator::new(ListenerId::next(), 1);

    (0..count)
        .map(|_| {
            let client = TcpStream::connect(addr).unwrap();
            let (stream, peer) = listener.accept().unwrap();
            (ConnectContext::new(id_gen.next(), stream, peer), client)
        })
        .collect()
}

/// A scheduler that admits everything and counts what it sees
#[derive(Default)]
pub struct CountingScheduler {
    pub submitted: AtomicUsize,
}

impl ConnectScheduler for CountingScheduler {
    fn submit(&self, context: ConnectContext) -> Result<(), ConnectContext> {
        tracing::info!("admitting {}", context.id());
        assert_eq!(context.state(), SessionState::New);
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A scheduler that turns everything away, checking it gets open sockets
#[derive(Default)]
pub struct RejectingScheduler {
    pub rejected: AtomicUsize,
}

impl ConnectScheduler for RejectingScheduler {
    fn submit(&self, context: ConnectContext) -> Result<(), ConnectContext> {
        tracing::info!("rejecting {}", context.id());
        assert!(!context.is_closed());
        self.rejected.fetch_add(1, Ordering::SeqCst);
        Err(context)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A scheduler with a bug: `submit` panics on the first connection
pub struct PanickingScheduler;

impl ConnectScheduler for PanickingScheduler {
    fn submit(&self, _context: ConnectContext) -> Result<(), ConnectContext> {
        panic!("scheduler bug");
    }
}
