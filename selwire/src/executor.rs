//! Fixed worker pool that runs the work units the selector hands back.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;

use tracing::warn;

use crate::error::{Error, Result};
use crate::metrics;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed pool of named worker threads fed from an unbounded queue.
pub struct Executor {
    tx: Mutex<Option<crossbeam_channel::Sender<Job>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Executor {
    /// Spawn `threads` workers (0 = number of CPUs).
    pub fn new(threads: usize) -> Result<Self> {
        let threads = if threads == 0 { num_cpus() } else { threads };
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();

        let mut handles = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("selwire-worker-{worker_id}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            metrics::DISPATCH_FAILURES.increment();
                            warn!(worker_id, "work unit panicked");
                        }
                    }
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        Ok(Executor {
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
        })
    }

    /// Queue a work unit. Dropped with a warning if the pool has shut down.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        metrics::DISPATCHES.increment();
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => {
                // Unbounded channel: send only fails if all receivers died.
                if tx.send(Box::new(job)).is_err() {
                    metrics::DISPATCH_FAILURES.increment();
                    warn!("executor workers gone, dropping work unit");
                }
            }
            None => {
                metrics::DISPATCH_FAILURES.increment();
                warn!("executor shut down, dropping work unit");
            }
        }
    }

    /// Stop accepting work, drain the queue, and join the workers.
    pub fn shutdown(&self) {
        drop(self.tx.lock().unwrap().take());
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
