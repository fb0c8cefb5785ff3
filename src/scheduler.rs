//! The orchestrator: accepts jobs, owns the queue, the worker pool and the
//! job index, and answers status and progress queries.

use crate::pool::{PoolStatus, WorkerPool};
use crate::progress::{ObserverHandle, ProgressObserver, ProgressTable};
use crate::queue::PriorityQueue;
use crate::registry::{CancelReason, JobIndex};
use crate::retry::RetryPolicy;
use crate::worker::WorkerContext;
use crate::{
    Error, Job, JobId, JobRequest, Options, Priority, ProgressSnapshot, Retriever,
    SchedulerConfig, Status,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Lifecycle notifications, delivered to the sender passed to
/// [`Scheduler::with_events`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Started {
        id: JobId,
        attempt: u32,
    },
    Retrying {
        id: JobId,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Completed {
        id: JobId,
        filename: Option<String>,
    },
    Failed {
        id: JobId,
        error: String,
    },
    Cancelled {
        id: JobId,
        reason: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Started { id, .. }
            | JobEvent::Retrying { id, .. }
            | JobEvent::Completed { id, .. }
            | JobEvent::Failed { id, .. }
            | JobEvent::Cancelled { id, .. } => *id,
        }
    }
}

pub struct Scheduler {
    ctx: Arc<WorkerContext>,
    pool: WorkerPool,
    config: SchedulerConfig,
    runtime: Handle,
    shutting_down: AtomicBool,
}

impl Scheduler {
    /// Builds a scheduler; workers are not started until [`Scheduler::start`].
    /// Must be called from within a Tokio runtime, which the scheduler then
    /// uses for all of its tasks.
    pub fn new(config: SchedulerConfig, retriever: Arc<dyn Retriever>) -> Result<Self, Error> {
        Self::build(config, retriever, None)
    }

    /// Like [`Scheduler::new`], additionally reporting every job transition.
    pub fn with_events(
        config: SchedulerConfig,
        retriever: Arc<dyn Retriever>,
        events: UnboundedSender<JobEvent>,
    ) -> Result<Self, Error> {
        Self::build(config, retriever, Some(events))
    }

    fn build(
        config: SchedulerConfig,
        retriever: Arc<dyn Retriever>,
        events: Option<UnboundedSender<JobEvent>>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            Error::InvalidConfig("scheduler must be created inside a Tokio runtime".into())
        })?;

        let ctx = Arc::new(WorkerContext {
            queue: PriorityQueue::new(),
            index: JobIndex::new(),
            progress: ProgressTable::new(),
            retriever,
            policy: RetryPolicy::from(&config.retry),
            events,
            active: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });
        let pool = WorkerPool::new(Arc::clone(&ctx), runtime.clone(), config.max_concurrent);

        Ok(Self {
            ctx,
            pool,
            config,
            runtime,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Spawns the worker pool. Jobs submitted earlier wait in the queue until then.
    pub fn start(&self) -> Result<(), Error> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::PoolShutdown);
        }
        self.pool.start()
    }

    pub fn submit(
        &self,
        url: impl Into<String>,
        options: Options,
        priority: Priority,
    ) -> Result<JobId, Error> {
        self.submit_request(
            JobRequest::new(url)
                .with_options(options)
                .with_priority(priority),
        )
    }

    /// Validates, records and enqueues one job. Never waits for the job to run.
    pub fn submit_request(&self, request: JobRequest) -> Result<JobId, Error> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::PoolShutdown);
        }
        request.validate()?;

        let timeout = request.timeout.or(self.config.job_timeout);
        let mut job = Job::new(request, self.config.max_attempts);
        job.timeout = timeout;
        let id = job.id;
        let priority = job.priority;

        let cancel = self.ctx.shutdown.child_token();
        self.ctx.index.insert(&job, cancel.clone());
        match self.ctx.queue.enqueue(job) {
            Ok(sequence) => self.ctx.index.assign_sequence(id, sequence),
            Err(err) => {
                self.ctx.index.remove(id);
                return Err(err);
            }
        }
        if let Some(limit) = timeout {
            self.spawn_timeout(id, limit, cancel);
        }

        debug!(job_id = %id, %priority, "Job submitted");
        Ok(id)
    }

    /// Submits each URL as its own job. One rejected URL does not affect the rest.
    pub fn submit_batch<I, S>(
        &self,
        urls: I,
        options: Options,
        priority: Priority,
    ) -> Vec<Result<JobId, Error>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        urls.into_iter()
            .map(|url| self.submit(url, options.clone(), priority))
            .collect()
    }

    /// Cancels a job. Returns `Ok(false)` if it had already finished.
    ///
    /// A queued job is removed from the queue on the spot. An active job is
    /// marked CANCELLED as soon as its worker observes the request, whether
    /// or not the retriever stops.
    pub fn cancel(&self, id: JobId) -> Result<bool, Error> {
        cancel_job(&self.ctx, id, CancelReason::Requested)
    }

    pub fn status(&self, id: JobId) -> Result<Job, Error> {
        self.ctx.index.get(id).ok_or(Error::NotFound(id))
    }

    /// Job snapshots in submission order, optionally only those with `status`.
    pub fn jobs(&self, status: Option<Status>) -> Vec<Job> {
        self.ctx.index.list(status)
    }

    /// Waits until the job is terminal and returns its final snapshot.
    pub async fn wait(&self, id: JobId) -> Result<Job, Error> {
        self.ctx.index.wait(id).await
    }

    pub fn progress(&self, url: &str) -> Result<ProgressSnapshot, Error> {
        self.ctx
            .progress
            .get(url)
            .ok_or_else(|| Error::ProgressNotFound(url.to_string()))
    }

    pub fn progress_all(&self) -> HashMap<String, ProgressSnapshot> {
        self.ctx.progress.get_all()
    }

    pub fn subscribe_progress(&self, observer: impl ProgressObserver + 'static) -> ObserverHandle {
        self.ctx.progress.subscribe(observer)
    }

    pub fn unsubscribe_progress(&self, handle: ObserverHandle) -> bool {
        self.ctx.progress.unsubscribe(handle)
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Stops the scheduler. Only the first call has any effect.
    pub async fn shutdown(&self, graceful: bool) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already requested");
            return;
        }
        info!(graceful, "Scheduler shutting down");
        self.pool.stop(graceful).await;
        info!("Scheduler stopped.");
    }

    fn spawn_timeout(&self, id: JobId, limit: Duration, cancel: CancellationToken) {
        let ctx = Arc::clone(&self.ctx);
        self.runtime.spawn(
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        match cancel_job(&ctx, id, CancelReason::TimedOut(limit)) {
                            Ok(true) => warn!(job_id = %id, ?limit, "Job timed out"),
                            Ok(false) => {},
                            Err(err) => debug!(job_id = %id, error = %err, "Timeout for unknown job"),
                        }
                    },
                    _ = cancel.cancelled() => {},
                }
            }
            .in_current_span(),
        );
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.shutting_down.load(Ordering::SeqCst) {
            // Never shut down: stop the workers rather than leave them parked forever.
            self.ctx.shutdown.cancel();
            self.ctx.queue.close();
        }
    }
}

fn cancel_job(ctx: &WorkerContext, id: JobId, reason: CancelReason) -> Result<bool, Error> {
    if !ctx.index.request_cancel(id, reason)? {
        return Ok(false);
    }
    // If a worker got there first it will see the fired token instead.
    if let Some(job) = ctx.queue.remove(id) {
        ctx.finish_cancelled(job);
    }
    Ok(true)
}
