use crate::progress::{ProgressSink, ProgressTable};
use crate::queue::PriorityQueue;
use crate::registry::{CancelReason, JobIndex};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scheduler::JobEvent;
use crate::{Job, ProgressSnapshot, ProgressStatus, RetrievalError, RetrievalResult, Retriever};
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// State shared by every worker and by the scheduler that feeds them.
pub(crate) struct WorkerContext {
    pub queue: PriorityQueue,
    pub index: JobIndex,
    pub progress: ProgressTable,
    pub retriever: Arc<dyn Retriever>,
    pub policy: RetryPolicy,
    pub events: Option<UnboundedSender<JobEvent>>,
    /// Jobs currently inside a retrieval attempt.
    pub active: AtomicUsize,
    /// Root of every job's cancellation token; fired on forced shutdown.
    pub shutdown: CancellationToken,
}

impl WorkerContext {
    pub fn emit(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("Event receiver dropped");
            }
        }
    }

    /// Moves a job to the index as CANCELLED.
    pub fn finish_cancelled(&self, mut job: Job) {
        let reason = self.index.cancel_reason(job.id).unwrap_or(if self.shutdown.is_cancelled() {
            CancelReason::Shutdown
        } else {
            CancelReason::Requested
        });
        info!(job_id = %job.id, url = %job.url, %reason, "Job cancelled");
        let started = job.attempts > 0;
        job.cancel();
        if started {
            self.progress.update(
                ProgressSnapshot::new(job.url.clone(), ProgressStatus::Cancelled)
                    .with_error(reason.to_string()),
            );
        }
        self.emit(JobEvent::Cancelled {
            id: job.id,
            reason: reason.to_string(),
        });
        self.index.finish(job);
    }

    fn finish_failed(&self, mut job: Job, error: String) {
        warn!(job_id = %job.id, url = %job.url, attempts = job.attempts, error = %error, "Job failed");
        self.progress.update(
            ProgressSnapshot::new(job.url.clone(), ProgressStatus::Failed).with_error(error.clone()),
        );
        job.fail(error.clone());
        self.emit(JobEvent::Failed { id: job.id, error });
        self.index.finish(job);
    }

    fn finish_completed(&self, mut job: Job, result: RetrievalResult) {
        info!(job_id = %job.id, url = %job.url, attempts = job.attempts, "Job completed");
        let mut snapshot = self
            .progress
            .get(&job.url)
            .unwrap_or_else(|| ProgressSnapshot::new(job.url.clone(), ProgressStatus::Completed));
        snapshot.status = ProgressStatus::Completed;
        snapshot.percent_complete = 100.0;
        snapshot.eta_seconds = None;
        snapshot.error = None;
        snapshot.filename = result.filename.clone().or(snapshot.filename);
        snapshot.updated_at = chrono::Utc::now();
        self.progress.update(snapshot);

        self.emit(JobEvent::Completed {
            id: job.id,
            filename: result.filename.clone(),
        });
        job.complete(result);
        self.index.finish(job);
    }
}

enum Outcome {
    Done(RetrievalResult),
    Failed(RetrievalError),
    Cancelled,
    /// The retrieval task panicked or was aborted.
    Fault(String),
}

pub(crate) async fn start(ctx: Arc<WorkerContext>) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            job = ctx.queue.dequeue() => {
                match job {
                    None => {
                        debug!("Queue closed, worker exiting");
                        break;
                    },
                    Some(job) => process(&ctx, job).await,
                }
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip_all, fields(job_id = %job.id, url = %job.url))]
async fn process(ctx: &Arc<WorkerContext>, mut job: Job) {
    let cancel = ctx
        .index
        .token(job.id)
        .unwrap_or_else(|| ctx.shutdown.child_token());
    if cancel.is_cancelled() {
        ctx.finish_cancelled(job);
        return;
    }

    job.begin_attempt();
    ctx.index.publish(&job);
    ctx.active.fetch_add(1, Ordering::SeqCst);
    ctx.progress
        .update(ProgressSnapshot::new(job.url.clone(), ProgressStatus::Downloading));
    ctx.emit(JobEvent::Started {
        id: job.id,
        attempt: job.attempts,
    });
    debug!(attempt = job.attempts, max_attempts = job.max_attempts, "Starting attempt");

    let outcome = attempt(ctx, &job, &cancel).await;
    ctx.active.fetch_sub(1, Ordering::SeqCst);

    match outcome {
        Outcome::Done(result) => ctx.finish_completed(job, result),
        Outcome::Cancelled => ctx.finish_cancelled(job),
        Outcome::Fault(msg) => {
            error!(error = %msg, "Retrieval task faulted");
            ctx.finish_failed(job, format!("worker fault: {msg}"));
        }
        Outcome::Failed(err) => match ctx.policy.decide(job.attempts, job.max_attempts, &err) {
            RetryDecision::NoRetry => ctx.finish_failed(job, err.to_string()),
            RetryDecision::RetryAfter(delay) => retry_later(ctx, job, err, cancel, delay),
        },
    }
}

async fn attempt(ctx: &WorkerContext, job: &Job, cancel: &CancellationToken) -> Outcome {
    let sink = ProgressSink::new(ctx.progress.clone(), job.url.clone());
    let mut handle = {
        let retriever = Arc::clone(&ctx.retriever);
        let url = job.url.clone();
        let options = job.options.clone();
        let sink = sink.clone();
        let cancel = cancel.clone();
        tokio::spawn(
            async move { retriever.retrieve(&url, &options, sink, cancel).await }
                .instrument(info_span!("retrieve", attempt = job.attempts)),
        )
    };

    let outcome = tokio::select! {
        biased;
        joined = &mut handle => match joined {
            Ok(Ok(result)) => Outcome::Done(result),
            Ok(Err(RetrievalError::Cancelled)) => Outcome::Cancelled,
            Ok(Err(err)) => Outcome::Failed(err),
            Err(err) => Outcome::Fault(describe_join_error(err)),
        },
        _ = cancel.cancelled() => {
            // Dropping the handle detaches the task; whatever it returns is discarded.
            debug!("Abandoning retrieval");
            Outcome::Cancelled
        }
    };
    sink.close();
    outcome
}

fn retry_later(
    ctx: &Arc<WorkerContext>,
    mut job: Job,
    err: RetrievalError,
    cancel: CancellationToken,
    delay: Duration,
) {
    warn!(attempt = job.attempts, max_attempts = job.max_attempts, ?delay, error = %err, "Retrying job");
    job.retrying(err.to_string());
    ctx.index.publish(&job);
    ctx.progress.update(
        ProgressSnapshot::new(job.url.clone(), ProgressStatus::Retrying).with_error(err.to_string()),
    );
    ctx.emit(JobEvent::Retrying {
        id: job.id,
        attempt: job.attempts,
        delay,
        error: err.to_string(),
    });

    ctx.queue.defer();
    let ctx = Arc::clone(ctx);
    tokio::spawn(
        async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(job) = ctx.queue.requeue(job) {
                        ctx.finish_cancelled(job);
                    }
                },
                _ = cancel.cancelled() => {
                    ctx.queue.abandon_deferred();
                    ctx.finish_cancelled(job);
                }
            }
        }
        .in_current_span(),
    );
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}
