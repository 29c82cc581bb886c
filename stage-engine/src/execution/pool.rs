// Worker Pool
// Fixed set of workers draining one shared job queue

use crate::error::{EngineError, EngineResult};

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// A unit of work posted to the pool
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fixed-size pool of workers sharing a single FIFO job queue.
///
/// Workers start at construction and live until the queue is closed, either
/// by [`stop`](Self::stop) or by dropping the pool. Closing the queue never
/// abandons work: jobs already queued are still run before workers exit.
pub struct WorkerPool {
    sender: Option<mpsc::UnboundedSender<Job>>,
    workers: Vec<JoinHandle<()>>,
    size: usize,
}

impl WorkerPool {
    /// Start `size` workers on the current tokio runtime
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        // Only hold the queue lock while waiting for the next job
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else { break };
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            tracing::error!(worker, "pool job panicked");
                        }
                    }
                    tracing::trace!(worker, "pool worker exiting");
                })
            })
            .collect();

        tracing::debug!(workers = size, "started worker pool");

        Self {
            sender: Some(sender),
            workers,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job for the next free worker
    pub fn post<F>(&self, job: F) -> EngineResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| EngineError::internal("worker pool is stopped"))?;
        sender
            .send(Box::pin(job))
            .map_err(|_| EngineError::internal("worker pool is stopped"))
    }

    /// Queue a job and get a handle that resolves with its output.
    ///
    /// The handle errors if the job panicked before completing.
    pub fn submit<F, T>(&self, job: F) -> EngineResult<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(async move {
            let _ = tx.send(job.await);
        })?;
        Ok(rx)
    }

    /// Stop accepting jobs, then wait for queued and in-flight jobs to finish
    pub async fn stop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "pool worker ended abnormally");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue lets workers drain remaining jobs and exit
        self.sender.take();
    }
}
