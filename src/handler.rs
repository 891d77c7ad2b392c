//! Per-connection job.
//!
//! Each accepted connection becomes one pool job: read a request under a
//! deadline, write the fixed response, close. Failures stay inside the job.

use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum request bytes read from a connection.
const REQUEST_BUFFER_SIZE: usize = 1024;

/// Response written to every connection that sends a request.
pub const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\nHello, World!\r\n";

/// Settings shared by every connection job.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Deadline for the request to arrive, also applied to the write.
    pub read_timeout: Duration,
    /// Simulated processing time between reading and responding.
    pub process_delay: Duration,
}

/// Serve one connection, returning the number of request bytes read.
///
/// The stream is closed before this returns, whatever the outcome.
pub fn handle_connection(mut stream: TcpStream, settings: &HandlerSettings) -> io::Result<usize> {
    stream.set_read_timeout(Some(settings.read_timeout))?;
    stream.set_write_timeout(Some(settings.read_timeout))?;

    let mut request = BytesMut::zeroed(REQUEST_BUFFER_SIZE);
    let n = stream.read(&mut request)?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before sending a request",
        ));
    }
    request.truncate(n);

    if !settings.process_delay.is_zero() {
        thread::sleep(settings.process_delay);
    }

    stream.write_all(RESPONSE)?;
    stream.flush()?;

    // Peer may already be gone; the drop below closes the socket regardless.
    let _ = stream.shutdown(Shutdown::Both);

    Ok(request.len())
}

/// Build the pool job for an accepted connection.
pub fn connection_job(
    stream: TcpStream,
    peer: SocketAddr,
    settings: Arc<HandlerSettings>,
) -> impl FnOnce() + Send + 'static {
    move || match handle_connection(stream, &settings) {
        Ok(bytes) => debug!(peer = %peer, bytes, "Job completed"),
        Err(e) if is_timeout(&e) => warn!(
            peer = %peer,
            timeout_ms = settings.read_timeout.as_millis() as u64,
            "Connection timed out"
        ),
        Err(e) => warn!(peer = %peer, error = %e, "Connection error"),
    }
}

/// Socket timeouts surface as `WouldBlock` on Unix and `TimedOut` elsewhere.
fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
