//! Fixed-size worker pool fed through a rendezvous channel.
//!
//! Workers are plain OS threads. Submission hands a job directly to a ready
//! worker (the channel has no buffer), so a producer that outpaces the pool
//! blocks in [`WorkerPool::add_job`] until a worker frees up.
//!
//! Closing is explicit: [`WorkerPool::wait`] sends one stop message per
//! worker, then blocks on a completion barrier that every worker releases
//! exactly once when its loop ends.

use crossbeam::channel::{self, Receiver, Select, Sender};
use crossbeam::sync::WaitGroup;
use std::any::Any;
use std::io;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::{debug, error, trace};

/// A unit of work executed exactly once by one worker.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

/// A fixed set of worker threads consuming jobs from a shared queue.
pub struct WorkerPool {
    sender: Sender<Message>,
    workers: NonZeroUsize,
    done: WaitGroup,
}

impl WorkerPool {
    /// Spawn `workers` threads, each waiting for jobs.
    ///
    /// If a thread fails to spawn, the error is returned and the threads
    /// already started exit once the queue disconnects.
    pub fn new(workers: NonZeroUsize) -> io::Result<Self> {
        let (sender, receiver) = channel::bounded(0);
        let done = WaitGroup::new();

        for worker_id in 0..workers.get() {
            let receiver = receiver.clone();
            let done = done.clone();

            thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    worker_loop(worker_id, receiver);
                    drop(done);
                })?;
        }

        debug!(workers = workers.get(), "Worker pool started");

        Ok(Self {
            sender,
            workers,
            done,
        })
    }

    /// Number of workers in the pool.
    pub fn size(&self) -> usize {
        self.workers.get()
    }

    /// Hand a job to the next ready worker.
    ///
    /// Blocks until a worker receives it.
    #[allow(dead_code)] // the acceptor submits through `add_job_until`
    pub fn add_job<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.add_job_until(job, &channel::never());
    }

    /// Like [`add_job`](Self::add_job), but gives up once `cancel` becomes
    /// ready (a message or a disconnect), handing the job back unrun.
    pub fn add_job_until<F>(&self, job: F, cancel: &Receiver<()>) -> Result<(), Job>
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);

        if !matches!(cancel.try_recv(), Err(channel::TryRecvError::Empty)) {
            return Err(job);
        }

        let mut sel = Select::new();
        let send_idx = sel.send(&self.sender);
        sel.recv(cancel);
        let oper = sel.select();

        if oper.index() == send_idx {
            if oper.send(&self.sender, Message::Run(job)).is_err() {
                error!("No workers left to receive job, dropping it");
            }
            Ok(())
        } else {
            let _ = oper.recv(cancel);
            Err(job)
        }
    }

    /// Close the queue and block until every worker has exited.
    ///
    /// Jobs handed over before this call are all run first.
    pub fn wait(self) {
        for _ in 0..self.workers.get() {
            if self.sender.send(Message::Stop).is_err() {
                break;
            }
        }
        drop(self.sender);
        self.done.wait();
        debug!(workers = self.workers.get(), "Worker pool drained");
    }
}

fn worker_loop(worker_id: usize, receiver: Receiver<Message>) {
    trace!(worker = worker_id, "Worker started");

    // A disconnected queue means the pool was dropped without `wait`.
    while let Ok(Message::Run(job)) = receiver.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(
                worker = worker_id,
                panic = panic_message(&*payload),
                "Job panicked"
            );
        }
    }

    trace!(worker = worker_id, "Worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
