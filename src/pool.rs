use crate::worker::{self, WorkerContext};
use crate::Error;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::*;

/// Aggregate counts for external reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub queued: usize,
    /// Jobs waiting out a retry backoff.
    pub retrying: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Idle,
    Running,
    Stopped,
}

struct Inner {
    state: PoolState,
    workers: Vec<JoinHandle<()>>,
}

/// A fixed set of `max_concurrent` workers pulling from the shared queue.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    runtime: Handle,
    max_concurrent: usize,
    inner: Mutex<Inner>,
}

impl WorkerPool {
    pub(crate) fn new(ctx: Arc<WorkerContext>, runtime: Handle, max_concurrent: usize) -> Self {
        Self {
            ctx,
            runtime,
            max_concurrent,
            inner: Mutex::new(Inner {
                state: PoolState::Idle,
                workers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the workers. A no-op if they are already running.
    pub fn start(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        match inner.state {
            PoolState::Running => return Ok(()),
            PoolState::Stopped => return Err(Error::PoolShutdown),
            PoolState::Idle => {}
        }
        for worker_id in 0..self.max_concurrent {
            let ctx = Arc::clone(&self.ctx);
            let join_handle = self
                .runtime
                .spawn(worker::start(ctx).instrument(info_span!("worker", worker_id)));
            inner.workers.push(join_handle);
        }
        inner.state = PoolState::Running;
        info!(workers = self.max_concurrent, "Worker pool started");
        Ok(())
    }

    /// Stops the pool. Graceful: no new jobs are accepted, everything already
    /// accepted runs to a terminal state first. Forced: in-flight attempts are
    /// cancelled and pending jobs are marked CANCELLED.
    ///
    /// Returns false if the pool had already been stopped.
    pub async fn stop(&self, graceful: bool) -> bool {
        let (workers, was_running) = {
            let mut inner = self.lock();
            if inner.state == PoolState::Stopped {
                return false;
            }
            let was_running = inner.state == PoolState::Running;
            inner.state = PoolState::Stopped;
            (std::mem::take(&mut inner.workers), was_running)
        };
        info!(graceful, "Stopping worker pool");

        if graceful && was_running {
            self.ctx.queue.drain();
        } else {
            self.ctx.shutdown.cancel();
            for job in self.ctx.queue.close() {
                self.ctx.finish_cancelled(job);
            }
        }

        // Wait for all workers to complete
        for result in futures::future::join_all(workers).await {
            if let Err(err) = result {
                error!(error = %err, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped.");
        true
    }

    pub fn status(&self) -> PoolStatus {
        let counts = self.ctx.index.counts();
        PoolStatus {
            queued: self.ctx.queue.len(),
            retrying: self.ctx.queue.deferred(),
            active: self.ctx.active.load(Ordering::SeqCst),
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            max_concurrent: self.max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
