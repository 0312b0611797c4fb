//! Serialized execution worker.
//!
//! All handler invocations of one engine run through a single consumer task,
//! one at a time, in submission order. A job that panics is contained in its
//! own task and does not stop the worker.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::BoxFuture;
use crate::error::{Result, RpcError};

/// A queued unit of work.
pub type Job = BoxFuture<'static, ()>;

/// Cloneable submitter for a [`SerialWorker`].
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<Job>,
    stopped: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Queue a job. Fails once the worker has been shut down.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RpcError::WorkerStopped);
        }
        self.tx
            .send(Box::pin(job))
            .map_err(|_| RpcError::WorkerStopped)
    }
}

/// Single-consumer FIFO executor.
///
/// Jobs submitted before [`start`](Self::start) are held and run once the
/// worker starts.
pub struct SerialWorker {
    name: &'static str,
    handle: WorkerHandle,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SerialWorker {
    /// Number of concurrent executors. Handlers never overlap.
    pub const WORKER_COUNT: usize = 1;

    /// Create a stopped worker. `name` labels its log lines.
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            handle: WorkerHandle {
                tx,
                stopped: Arc::new(AtomicBool::new(false)),
            },
            rx: Mutex::new(Some(rx)),
            task: Mutex::new(None),
        }
    }

    /// A submitter that can outlive borrows of the worker.
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Queue a job.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.submit(job)
    }

    /// Spawn the consumer task. Must be called within a tokio runtime.
    ///
    /// Calling it again, or after shutdown, does nothing.
    pub fn start(&self) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        let task = tokio::spawn(run(self.name, rx));
        *self.task.lock() = Some(task);
        tracing::debug!("{} worker started", self.name);
    }

    /// Whether the consumer task is alive.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop the worker. Queued jobs are discarded; a job already running
    /// completes on its own.
    pub fn shutdown(&self) {
        self.handle.stopped.store(true, Ordering::Release);
        self.rx.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::debug!("{} worker stopped", self.name);
        }
    }
}

impl Drop for SerialWorker {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn run(name: &'static str, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        // Each job gets its own task so a panic is caught at the join.
        if let Err(e) = tokio::spawn(job).await {
            if e.is_panic() {
                tracing::error!("{} worker: handler panicked", name);
            }
        }
    }
}
