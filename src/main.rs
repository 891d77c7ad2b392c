//! pool-server: a TCP server backed by a fixed worker pool
//!
//! Every accepted connection is handed to one of a fixed number of worker
//! threads, which reads the request under a deadline, writes a fixed
//! response and closes the connection.
//!
//! Features:
//! - Rendezvous job queue: accepting stalls while every worker is busy
//! - Graceful shutdown on SIGINT/SIGTERM with a bounded drain timeout
//! - Per-connection read deadline; connection errors never stop a worker
//! - Configuration via CLI arguments or TOML file

mod config;
mod handler;
mod pool;
mod server;
mod shutdown;

use config::Config;
use server::Server;
use shutdown::DrainOutcome;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = config.workers.get(),
        read_timeout_ms = config.read_timeout.as_millis() as u64,
        drain_timeout_ms = config.drain_timeout.as_millis() as u64,
        "Starting pool-server"
    );

    let server = Server::bind(&config)?;
    info!(addr = %server.local_addr()?, "Server listening");
    shutdown::spawn_signal_listener(server.shutdown_handle())?;

    match server.run()? {
        DrainOutcome::Drained => info!("Server stopped"),
        // Returning from main ends the process, abandoning running jobs.
        DrainOutcome::TimedOut => warn!("Server stopped with jobs still running"),
    }

    Ok(())
}
