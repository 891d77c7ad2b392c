//! TCP acceptor feeding the worker pool.
//!
//! The listener is polled with mio so that a shutdown waker can interrupt a
//! pending accept. Each accepted connection is switched back to blocking
//! mode and submitted to the pool as one job; submission blocks while every
//! worker is busy, which throttles accepting to the pool's pace. A
//! submission still parked when draining begins is abandoned and its
//! connection closed, so the listener closes without waiting on a worker.

use crate::config::Config;
use crate::handler::{connection_job, HandlerSettings};
use crate::pool::WorkerPool;
use crate::shutdown::{DrainOutcome, Shutdown};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);

/// Listen backlog passed to `listen(2)`.
const BACKLOG: i32 = 1024;

/// How long to wait before retrying accept after an accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    listener: TcpListener,
    poll: Poll,
    pool: WorkerPool,
    shutdown: Arc<Shutdown>,
    settings: Arc<HandlerSettings>,
}

impl Server {
    /// Bind the listener and start the worker pool.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| ServerError::Bind(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let listener = create_listener(addr).map_err(ServerError::Bind)?;

        let poll = Poll::new().map_err(ServerError::Poll)?;
        poll.registry()
            .register(
                &mut SourceFd(&listener.as_raw_fd()),
                LISTENER_TOKEN,
                Interest::READABLE,
            )
            .map_err(ServerError::Poll)?;

        let shutdown =
            Shutdown::new(poll.registry(), config.drain_timeout).map_err(ServerError::Poll)?;
        let pool = WorkerPool::new(config.workers).map_err(ServerError::Pool)?;

        Ok(Server {
            listener,
            poll,
            pool,
            shutdown: Arc::new(shutdown),
            settings: Arc::new(config.handler_settings()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle used to trigger and observe shutdown.
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Accept connections until draining begins, then drain the pool.
    pub fn run(self) -> Result<DrainOutcome, ServerError> {
        let Server {
            listener,
            mut poll,
            pool,
            shutdown,
            settings,
        } = self;

        info!(workers = pool.size(), "Accepting connections");
        let accepted = accept_loop(&listener, &mut poll, &pool, &shutdown, &settings);

        if let Err(e) = poll
            .registry()
            .deregister(&mut SourceFd(&listener.as_raw_fd()))
        {
            debug!(error = %e, "Failed to deregister listener");
        }
        drop(listener);
        debug!("Listener closed");

        if let Err(ref e) = accepted {
            error!(error = %e, "Acceptor failed, shutting down");
        }

        let outcome = shutdown.finish(pool).map_err(ServerError::Drain)?;
        accepted.map_err(ServerError::Poll)?;

        Ok(outcome)
    }
}

fn accept_loop(
    listener: &TcpListener,
    poll: &mut Poll,
    pool: &WorkerPool,
    shutdown: &Shutdown,
    settings: &Arc<HandlerSettings>,
) -> io::Result<()> {
    let mut events = Events::with_capacity(64);
    let mut retry = false;

    loop {
        if shutdown.is_draining() {
            return Ok(());
        }

        let timeout = retry.then_some(ACCEPT_RETRY_DELAY);
        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        let readable = events.iter().any(|e| e.token() == LISTENER_TOKEN);
        if readable || retry {
            retry = accept_connections(listener, pool, shutdown, settings);
        }
    }
}

/// Source of accepted connections.
trait Accept {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

impl Accept for TcpListener {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self)
    }
}

/// What to do after a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptError {
    /// Backlog empty, wait for the next readiness event.
    Idle,
    /// Interrupted by a signal, try again right away.
    Again,
    /// The listener is closing for shutdown, stop quietly.
    Closing,
    /// Transient failure while running, log and retry after a delay.
    Transient,
}

fn classify_accept_error(e: &io::Error, draining: bool) -> AcceptError {
    match e.kind() {
        io::ErrorKind::WouldBlock => AcceptError::Idle,
        io::ErrorKind::Interrupted => AcceptError::Again,
        _ if draining => AcceptError::Closing,
        _ => AcceptError::Transient,
    }
}

/// Accept until the backlog is empty.
///
/// Returns true if accepting stopped on an error and should be retried.
fn accept_connections<A: Accept>(
    listener: &A,
    pool: &WorkerPool,
    shutdown: &Shutdown,
    settings: &Arc<HandlerSettings>,
) -> bool {
    loop {
        if shutdown.is_draining() {
            return false;
        }

        let e = match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(peer = %peer, error = %e, "Failed to configure connection");
                    continue;
                }

                debug!(peer = %peer, "Client connected");
                let job = connection_job(stream, peer, Arc::clone(settings));
                if pool.add_job_until(job, shutdown.draining()).is_err() {
                    debug!(peer = %peer, "Shutting down, closing unserved connection");
                    return false;
                }
                continue;
            }
            Err(e) => e,
        };

        match classify_accept_error(&e, shutdown.is_draining()) {
            AcceptError::Idle => return false,
            AcceptError::Again => continue,
            AcceptError::Closing => {
                debug!(error = %e, "Accept interrupted by shutdown");
                return false;
            }
            AcceptError::Transient => {
                error!(error = %e, "Failed to accept connection");
                return true;
            }
        }
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// Server errors. All of them end the process.
#[derive(Debug)]
pub enum ServerError {
    Bind(io::Error),
    Poll(io::Error),
    Pool(io::Error),
    Drain(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(e) => write!(f, "Failed to bind listener: {}", e),
            ServerError::Poll(e) => write!(f, "Acceptor poll failed: {}", e),
            ServerError::Pool(e) => write!(f, "Failed to start worker pool: {}", e),
            ServerError::Drain(e) => write!(f, "Failed to drain worker pool: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(e)
            | ServerError::Poll(e)
            | ServerError::Pool(e)
            | ServerError::Drain(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RESPONSE;
    use crate::shutdown::Lifecycle;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::collections::VecDeque;
    use std::num::NonZeroUsize;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    fn test_config(workers: usize, drain_timeout_ms: u64) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            workers: NonZeroUsize::new(workers).unwrap(),
            read_timeout: Duration::from_millis(500),
            process_delay: Duration::ZERO,
            drain_timeout: Duration::from_millis(drain_timeout_ms),
            log_level: "info".to_string(),
        }
    }

    fn request(addr: SocketAddr) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        response
    }

    #[test]
    fn test_serves_and_drains() {
        let server = Server::bind(&test_config(2, 1000)).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());

        for _ in 0..5 {
            assert_eq!(request(addr), RESPONSE);
        }

        assert!(shutdown.begin_drain());
        let outcome = handle.join().unwrap().unwrap();

        assert_eq!(outcome, DrainOutcome::Drained);
        assert_eq!(shutdown.state(), Lifecycle::Drained);
    }

    #[test]
    fn test_listener_closed_after_drain_begins() {
        let server = Server::bind(&test_config(1, 1000)).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());

        shutdown.begin_drain();
        handle.join().unwrap().unwrap();

        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_in_flight_job_finishes_during_drain() {
        let mut config = test_config(1, 2000);
        config.process_delay = Duration::from_millis(300);
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());

        let client = thread::spawn(move || request(addr));
        thread::sleep(Duration::from_millis(100));
        shutdown.begin_drain();

        assert_eq!(client.join().unwrap(), RESPONSE);
        assert_eq!(handle.join().unwrap().unwrap(), DrainOutcome::Drained);
    }

    #[test]
    fn test_slow_job_times_out_drain() {
        let mut config = test_config(1, 100);
        config.process_delay = Duration::from_millis(1000);
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"hello").unwrap();
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        shutdown.begin_drain();
        let outcome = handle.join().unwrap().unwrap();

        assert_eq!(outcome, DrainOutcome::TimedOut);
        assert_eq!(shutdown.state(), Lifecycle::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(800));
    }

    #[test]
    fn test_parked_connection_does_not_delay_drain() {
        let mut config = test_config(1, 100);
        config.process_delay = Duration::from_millis(2000);
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());

        // Occupies the only worker.
        let mut busy = TcpStream::connect(addr).unwrap();
        busy.write_all(b"first").unwrap();
        thread::sleep(Duration::from_millis(100));

        // Accepted, then parked waiting for a worker.
        let mut parked = TcpStream::connect(addr).unwrap();
        parked.write_all(b"second").unwrap();
        parked
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        shutdown.begin_drain();
        let outcome = handle.join().unwrap().unwrap();

        assert_eq!(outcome, DrainOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(600));
        assert!(TcpStream::connect(addr).is_err());

        let mut response = Vec::new();
        let _ = parked.read_to_end(&mut response);
        assert!(response.is_empty());
        drop(busy);
    }

    /// Replays a fixed sequence of accept results, then reports an empty backlog.
    struct ScriptedAccept(Mutex<VecDeque<io::Result<(TcpStream, SocketAddr)>>>);

    impl ScriptedAccept {
        fn new(results: Vec<io::Result<(TcpStream, SocketAddr)>>) -> Self {
            Self(Mutex::new(results.into()))
        }
    }

    impl Accept for ScriptedAccept {
        fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(io::ErrorKind::WouldBlock.into()))
        }
    }

    #[test]
    fn test_classify_accept_error() {
        let cases = [
            (io::ErrorKind::WouldBlock, false, AcceptError::Idle),
            (io::ErrorKind::WouldBlock, true, AcceptError::Idle),
            (io::ErrorKind::Interrupted, false, AcceptError::Again),
            (io::ErrorKind::ConnectionAborted, false, AcceptError::Transient),
            (io::ErrorKind::ConnectionAborted, true, AcceptError::Closing),
            (io::ErrorKind::InvalidInput, true, AcceptError::Closing),
            (io::ErrorKind::Other, false, AcceptError::Transient),
        ];

        for (kind, draining, expected) in cases {
            let e = io::Error::from(kind);
            assert_eq!(classify_accept_error(&e, draining), expected, "{kind:?}");
        }
    }

    #[test]
    fn test_accept_error_while_running_keeps_serving() {
        let poll = Poll::new().unwrap();
        let shutdown = Shutdown::new(poll.registry(), Duration::from_secs(1)).unwrap();
        let pool = WorkerPool::new(NonZeroUsize::new(1).unwrap()).unwrap();
        let settings = Arc::new(test_config(1, 1000).handler_settings());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.write_all(b"hello").unwrap();
        let accepted = listener.accept().unwrap();

        let source = ScriptedAccept::new(vec![
            Err(io::ErrorKind::ConnectionAborted.into()),
            Ok(accepted),
        ]);

        assert!(accept_connections(&source, &pool, &shutdown, &settings));
        assert!(!accept_connections(&source, &pool, &shutdown, &settings));

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, RESPONSE);
        assert_eq!(shutdown.state(), Lifecycle::Running);

        pool.wait();
    }

    #[test]
    fn test_bind_invalid_address() {
        let mut config = test_config(1, 100);
        config.listen = "not-an-address".to_string();

        assert!(matches!(Server::bind(&config), Err(ServerError::Bind(_))));
    }

    #[test]
    fn test_bind_address_in_use() {
        let first = Server::bind(&test_config(1, 100)).unwrap();
        let mut config = test_config(1, 100);
        config.listen = first.local_addr().unwrap().to_string();

        assert!(matches!(Server::bind(&config), Err(ServerError::Bind(_))));
    }
}
