//! Compile worker pool.
//!
//! A fixed set of named threads pulling jobs from a shared crossbeam
//! channel. Jobs are processed in no particular order. Shutting down closes
//! the channel; workers drain what is left and exit, then get joined.

use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};

/// Default worker count: half the available parallelism, at least one.
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

pub struct WorkerPool<J: Send + 'static> {
    sender: Option<Sender<J>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn `count` workers, each calling `handler` for every job it receives.
    pub fn start<F>(count: usize, handler: F) -> io::Result<Self>
    where
        F: Fn(J) + Send + Sync + 'static,
    {
        let (sender, receiver) = channel::unbounded::<J>();
        let handler = Arc::new(handler);
        let mut pool = Self {
            sender: Some(sender),
            handles: Vec::with_capacity(count),
        };

        for i in 0..count.max(1) {
            let receiver = receiver.clone();
            let handler = Arc::clone(&handler);
            // On error the pool is dropped, which joins the workers already spawned
            let handle = thread::Builder::new()
                .name(format!("orca-compile-{}", i))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        handler(job);
                    }
                })?;
            pool.handles.push(handle);
        }

        tracing::debug!(workers = pool.handles.len(), "started compile workers");
        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Queue a job. Hands the job back if the pool has shut down.
    pub fn submit(&self, job: J) -> Result<(), J> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }

    /// Close the channel and join every worker. Idempotent.
    pub fn shutdown(&mut self) {
        drop(self.sender.take());

        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("orca-compile").to_string();
            if let Err(payload) = handle.join() {
                // Don't re-panic here, shutdown also runs from Drop
                tracing::error!(
                    worker = %name,
                    panic = ?payload.downcast_ref::<&str>(),
                    "compile worker panicked"
                );
            }
        }
    }
}

impl<J: Send + 'static> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<J: Send + 'static> std::fmt::Debug for WorkerPool<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .field("active", &self.sender.is_some())
            .finish()
    }
}
