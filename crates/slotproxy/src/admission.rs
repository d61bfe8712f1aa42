//! RequestAdmitter: bounded FIFO queue in front of a fixed worker pool.
//!
//! Capacity is `workers + queue_capacity` outstanding tasks, enforced by a
//! semaphore whose permit travels with the task until its worker is done with it.
//! A submission that finds no permit is rejected on the spot; nothing ever
//! blocks the submitter.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::{ProxyMetrics, RejectReason};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmitterConfig {
    /// Fixed worker count; one per slot.
    pub workers: usize,
    /// Tasks that may wait for a worker.
    pub queue_capacity: usize,
}

impl AdmitterConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn capacity(&self) -> usize {
        self.workers + self.queue_capacity
    }
}

/// A rejected submission hands the item back so the caller can answer it.
#[derive(Debug, thiserror::Error)]
pub enum AdmitError<T> {
    #[error("request queue is full")]
    QueueFull(T),
    #[error("admitter is shut down")]
    Closed(T),
}

impl<T> AdmitError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::QueueFull(item) | Self::Closed(item) => item,
        }
    }
}

struct Task<T> {
    item: T,
    enqueued_at: Instant,
    permit: OwnedSemaphorePermit,
}

type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<Task<T>>>>;

pub struct RequestAdmitter<T> {
    config: AdmitterConfig,
    permits: Arc<Semaphore>,
    tx: mpsc::Sender<Task<T>>,
    rx: SharedReceiver<T>,
    metrics: Arc<ProxyMetrics>,
    cancel: CancellationToken,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> RequestAdmitter<T> {
    /// Start `config.workers` workers, each running `handler` on one task at a time.
    pub fn spawn<F, Fut>(config: AdmitterConfig, metrics: Arc<ProxyMetrics>, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let config = if config.workers == 0 {
            tracing::warn!("Admitter configured with zero workers, using one");
            AdmitterConfig {
                workers: 1,
                ..config
            }
        } else {
            config
        };

        let capacity = config.capacity();
        let (tx, rx) = mpsc::channel(capacity);
        let rx: SharedReceiver<T> = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);
        let cancel = CancellationToken::new();

        let workers = (0..config.workers)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&rx),
                    Arc::clone(&handler),
                    Arc::clone(&metrics),
                    cancel.clone(),
                ))
            })
            .collect();

        tracing::info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Request admitter started"
        );

        Self {
            config,
            permits: Arc::new(Semaphore::new(capacity)),
            tx,
            rx,
            metrics,
            cancel,
            workers: StdMutex::new(workers),
        }
    }

    /// Enqueue `item`, or reject it immediately.
    pub fn submit(&self, item: T) -> Result<(), AdmitError<T>> {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.metrics.task_rejected(RejectReason::QueueFull);
                return Err(AdmitError::QueueFull(item));
            }
            Err(TryAcquireError::Closed) => return Err(AdmitError::Closed(item)),
        };

        self.metrics.task_accepted();
        let task = Task {
            item,
            enqueued_at: Instant::now(),
            permit,
        };

        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            // The channel is sized to the permit count; Full means the two disagree.
            Err(TrySendError::Full(task)) => {
                self.metrics.task_withdrawn();
                self.metrics.task_rejected(RejectReason::QueueFull);
                Err(AdmitError::QueueFull(task.item))
            }
            Err(TrySendError::Closed(task)) => {
                self.metrics.task_withdrawn();
                Err(AdmitError::Closed(task.item))
            }
        }
    }

    pub fn config(&self) -> AdmitterConfig {
        self.config
    }

    /// Tasks accepted but not yet taken by a worker.
    pub fn pending(&self) -> i64 {
        self.metrics.pending()
    }

    /// Tasks queued or being handled.
    pub fn outstanding(&self) -> usize {
        self.config.capacity() - self.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Stop admitting and stop the workers.
    ///
    /// Workers finish the task they hold; any still busy once `grace` has
    /// elapsed (counted once, for all of them) are aborted. Tasks still queued
    /// are returned in FIFO order.
    pub async fn shutdown(&self, grace: Duration) -> Vec<T> {
        self.permits.close();
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for mut handle in workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Worker task failed"),
                Err(_) => {
                    tracing::warn!(?grace, "Worker still busy after grace period, aborting");
                    handle.abort();
                }
            }
        }

        let mut rx = self.rx.lock().await;
        // A submit that won its permit before the semaphore closed now gets
        // `Closed` from `try_send` instead of landing behind the drain.
        rx.close();
        let mut drained = Vec::new();
        while let Ok(task) = rx.try_recv() {
            self.metrics.task_withdrawn();
            drained.push(task.item);
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Drained queued requests at shutdown");
        }
        drained
    }
}

async fn worker_loop<T, F, Fut>(
    worker: usize,
    rx: SharedReceiver<T>,
    handler: Arc<F>,
    metrics: Arc<ProxyMetrics>,
    cancel: CancellationToken,
) where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tracing::debug!(worker, "Worker started");
    loop {
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = async { rx.lock().await.recv().await } => match task {
                Some(task) => task,
                None => break,
            },
        };

        metrics.task_dequeued(task.enqueued_at.elapsed());

        let Task { item, permit, .. } = task;
        if AssertUnwindSafe((*handler)(item))
            .catch_unwind()
            .await
            .is_err()
        {
            tracing::error!(worker, "Task handler panicked");
        }
        drop(permit);
    }
    tracing::debug!(worker, "Worker stopped");
}
