//! Bounded worker pool for fire-and-forget side effects

use futures::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Tasks allowed to wait for a worker, per worker
const QUEUE_PER_WORKER: usize = 16;

/// Why the pool refused a task
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PoolRejection {
    #[error("side-effect pool is shut down")]
    Closed,

    #[error("side-effect pool is full ({0} tasks pending)")]
    Full(usize),
}

/// Runs side effects concurrently, at most `workers` at a time
///
/// Every task stays tracked until it finishes so shutdown can wait for, or
/// abort, the ones still running. At most `limit` tasks are tracked at
/// once; beyond that new work is refused rather than queued.
pub struct SideEffectPool {
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    limit: usize,
    closed: AtomicBool,
}

impl SideEffectPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            tasks: Mutex::new(JoinSet::new()),
            limit: workers * (QUEUE_PER_WORKER + 1),
            closed: AtomicBool::new(false),
        }
    }

    /// Cap on tasks queued or running
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Queue a task unless the pool is shutting down or full
    pub fn spawn<F>(&self, task: F) -> Result<(), PoolRejection>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolRejection::Closed);
        }
        let permits = self.permits.clone();
        let mut tasks = self.lock_tasks();
        while tasks.try_join_next().is_some() {}
        if tasks.len() >= self.limit {
            warn!(pending = tasks.len(), "Side-effect pool full, refusing task");
            return Err(PoolRejection::Full(tasks.len()));
        }
        tasks.spawn(async move {
            // Only fails if the semaphore is closed, which never happens
            let _permit = permits.acquire_owned().await;
            task.await;
        });
        Ok(())
    }

    /// Tasks queued or running
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.lock_tasks();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Stop accepting work and wait up to `grace` for running tasks
    ///
    /// Tasks still running after `grace` are aborted. Returns how many were.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        debug!(pending = tasks.len(), "Draining side-effect pool");

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        warn!("Side-effect task panicked");
                    }
                }
            }
        })
        .await;

        if drained.is_ok() {
            return 0;
        }
        let aborted = tasks.len();
        warn!(aborted, "Aborting side effects still running at shutdown");
        tasks.shutdown().await;
        aborted
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
