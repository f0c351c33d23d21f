//! One thread per worker.
//!
//! Each thread ticks its worker, then waits for the worker's interval or for
//! shutdown, whichever comes first. Shutdown raises the shared [`StopFlag`]
//! so in-flight traversals return early, then disconnects the shutdown
//! channel to wake sleeping threads, then joins them.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tangle_consensus::{StopFlag, Worker};
use tracing::{debug, error, info};

use crate::context::NodeError;

/// Running worker threads.
pub struct WorkerSet {
    stop: StopFlag,
    shutdown: Option<Sender<()>>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl std::fmt::Debug for WorkerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSet")
            .field("workers", &self.names())
            .field("stopped", &self.stop.is_stopped())
            .finish()
    }
}

impl WorkerSet {
    /// Start a thread for each of `workers`.
    ///
    /// If a thread cannot be spawned, the ones already started are shut
    /// down before the error is returned.
    pub fn spawn(workers: Vec<Arc<dyn Worker>>) -> Result<Self, NodeError> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let mut set = Self {
            stop: StopFlag::new(),
            shutdown: Some(shutdown_tx),
            handles: Vec::with_capacity(workers.len()),
        };
        for worker in workers {
            let name = worker.name();
            let stop = set.stop.clone();
            let shutdown = shutdown_rx.clone();
            let spawned = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || run_worker(worker.as_ref(), &stop, &shutdown));
            match spawned {
                Ok(handle) => set.handles.push((name, handle)),
                Err(source) => {
                    set.shutdown();
                    return Err(NodeError::Spawn { name, source });
                }
            }
        }
        info!(workers = set.handles.len(), "Workers started");
        Ok(set)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Handle for stopping the workers from another thread.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Stop every worker and wait for its thread to finish.
    pub fn shutdown(&mut self) {
        self.stop.stop();
        self.shutdown.take();
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(worker = name, "worker thread panicked");
            } else {
                debug!(worker = name, "worker stopped");
            }
        }
    }
}

impl Drop for WorkerSet {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown();
        }
    }
}

fn run_worker(worker: &dyn Worker, stop: &StopFlag, shutdown: &Receiver<()>) {
    debug!(worker = worker.name(), "worker started");
    while !stop.is_stopped() {
        worker.tick(stop);
        match shutdown.recv_timeout(worker.interval()) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
