//! Graceful shutdown coordination.
//!
//! The lifecycle only moves forward:
//!
//! ```text
//! Running -> Draining -> Drained
//!                     \-> TimedOut
//! ```
//!
//! A termination signal moves the server to `Draining`, which starts the
//! drain countdown and wakes the acceptor so it closes the listener. The pool
//! then gets until the countdown expires to finish its outstanding jobs.
//!
//! An acceptor parked on a full pool is released through [`Shutdown::draining`],
//! so neither the listener close nor the countdown waits on a busy worker.

use crate::pool::WorkerPool;
use crossbeam::channel::{self, select, Receiver, Sender};
use mio::{Registry, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Poll token used to wake the acceptor when draining begins.
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Accepting connections and running jobs.
    Running = 0,
    /// Listener closed, outstanding jobs finishing.
    Draining = 1,
    /// Every worker finished before the deadline.
    Drained = 2,
    /// The deadline passed with jobs still running.
    TimedOut = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Running,
            1 => Lifecycle::Draining,
            2 => Lifecycle::Drained,
            _ => Lifecycle::TimedOut,
        }
    }
}

/// Terminal result of a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    TimedOut,
}

/// Shared shutdown state and drain driver.
pub struct Shutdown {
    state: AtomicU8,
    waker: Waker,
    drain_timeout: Duration,
    drain_started: OnceLock<Instant>,
    // Dropped when draining begins; disconnecting `draining_rx`.
    draining_tx: Mutex<Option<Sender<()>>>,
    draining_rx: Receiver<()>,
}

impl Shutdown {
    /// Create a coordinator whose waker is registered with `registry`.
    pub fn new(registry: &Registry, drain_timeout: Duration) -> io::Result<Self> {
        let (draining_tx, draining_rx) = channel::bounded(0);

        Ok(Self {
            state: AtomicU8::new(Lifecycle::Running as u8),
            waker: Waker::new(registry, WAKER_TOKEN)?,
            drain_timeout,
            drain_started: OnceLock::new(),
            draining_tx: Mutex::new(Some(draining_tx)),
            draining_rx,
        })
    }

    /// Receiver that becomes ready (disconnected) once draining begins.
    pub fn draining(&self) -> &Receiver<()> {
        &self.draining_rx
    }

    pub fn state(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once draining has begun, including terminal states.
    pub fn is_draining(&self) -> bool {
        self.state() != Lifecycle::Running
    }

    /// Move from `Running` to `Draining` and start the drain countdown.
    ///
    /// Returns false if draining had already begun.
    pub fn begin_drain(&self) -> bool {
        if self
            .state
            .compare_exchange(
                Lifecycle::Running as u8,
                Lifecycle::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        self.drain_started.get_or_init(Instant::now);
        info!(
            timeout_ms = self.drain_timeout.as_millis() as u64,
            "Draining: listener closing, waiting for outstanding jobs"
        );

        self.draining_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake acceptor");
        }

        true
    }

    /// Close `pool` and wait for it until the drain deadline.
    ///
    /// Starts draining if it has not begun yet. On timeout the pool and any
    /// job still running are abandoned.
    pub fn finish(&self, pool: WorkerPool) -> io::Result<DrainOutcome> {
        self.begin_drain();

        let deadline = match self.drain_started.get() {
            Some(started) => *started + self.drain_timeout,
            None => Instant::now() + self.drain_timeout,
        };

        let outcome = drain_until(pool, deadline)?;

        let terminal = match outcome {
            DrainOutcome::Drained => Lifecycle::Drained,
            DrainOutcome::TimedOut => Lifecycle::TimedOut,
        };
        if self
            .state
            .compare_exchange(
                Lifecycle::Draining as u8,
                terminal as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            warn!(state = ?self.state(), "Drain finished twice, keeping first outcome");
        }

        match outcome {
            DrainOutcome::Drained => info!("All jobs completed"),
            DrainOutcome::TimedOut => warn!(
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Timed out waiting for jobs, abandoning them"
            ),
        }

        Ok(outcome)
    }
}

/// Race `pool.wait()` against `deadline`; whichever fires first wins.
fn drain_until(pool: WorkerPool, deadline: Instant) -> io::Result<DrainOutcome> {
    let (done_tx, done_rx) = channel::bounded(1);

    thread::Builder::new()
        .name("pool-drain".to_string())
        .spawn(move || {
            pool.wait();
            let _ = done_tx.send(());
        })?;

    let remaining = deadline.saturating_duration_since(Instant::now());
    Ok(race_deadline(&done_rx, remaining))
}

/// First-to-fire between `done` and `remaining`. A pool that has already
/// finished wins over an already-expired deadline.
fn race_deadline(done: &Receiver<()>, remaining: Duration) -> DrainOutcome {
    if done.try_recv().is_ok() {
        return DrainOutcome::Drained;
    }

    select! {
        recv(done) -> _ => DrainOutcome::Drained,
        recv(channel::after(remaining)) -> _ => {
            if done.try_recv().is_ok() {
                DrainOutcome::Drained
            } else {
                DrainOutcome::TimedOut
            }
        }
    }
}

/// Block the current thread until SIGINT or SIGTERM arrives.
pub fn wait_for_signal() -> io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;

    rt.block_on(async {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                info!(signal = "SIGINT", "Received signal");
            }
            _ = terminate.recv() => {
                info!(signal = "SIGTERM", "Received signal");
            }
        }

        Ok::<(), io::Error>(())
    })
}

/// Start draining `shutdown` when a termination signal arrives.
pub fn spawn_signal_listener(shutdown: Arc<Shutdown>) -> io::Result<()> {
    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || match wait_for_signal() {
            Ok(()) => {
                shutdown.begin_drain();
            }
            Err(e) => warn!(error = %e, "Signal listener failed"),
        })?;

    Ok(())
}
