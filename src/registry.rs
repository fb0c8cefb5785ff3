//! Bookkeeping for every job the scheduler has accepted.
//!
//! While a job is pending or in flight the index holds the snapshot last
//! published by its current owner (the queue or a worker). Once the job is
//! terminal the index owns it outright: this is the completed/failed index.

use crate::{Error, Job, JobId, Status};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why a job's cancellation token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Requested,
    TimedOut(Duration),
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancelled by request"),
            CancelReason::TimedOut(after) => write!(f, "timed out after {:?}", after),
            CancelReason::Shutdown => write!(f, "cancelled by shutdown"),
        }
    }
}

struct Entry {
    /// Insertion order; breaks ties between jobs submitted in the same clock tick.
    order: u64,
    job: Job,
    cancel: CancellationToken,
    reason: Option<CancelReason>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TerminalCounts {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct JobIndex {
    entries: Mutex<HashMap<JobId, Entry>>,
    next_order: AtomicU64,
    /// Bumped on every terminal transition.
    finished: watch::Sender<u64>,
}

impl Default for JobIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl JobIndex {
    pub fn new() -> Self {
        let (finished, _) = watch::channel(0);
        Self {
            entries: Mutex::new(HashMap::new()),
            next_order: AtomicU64::new(0),
            finished,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, job: &Job, cancel: CancellationToken) {
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(
            job.id,
            Entry {
                order,
                job: job.clone(),
                cancel,
                reason: None,
            },
        );
    }

    /// Forgets a job that never made it into the queue.
    pub fn remove(&self, id: JobId) {
        self.lock().remove(&id);
    }

    /// Records the queue position a freshly enqueued job was given.
    pub fn assign_sequence(&self, id: JobId, sequence: u64) {
        if let Some(entry) = self.lock().get_mut(&id) {
            if entry.job.attempts == 0 {
                entry.job.sequence = sequence;
            }
        }
    }

    /// Records the owner's latest view of a non-terminal job.
    pub fn publish(&self, job: &Job) {
        if let Some(entry) = self.lock().get_mut(&job.id) {
            if !entry.job.status.is_terminal() {
                entry.job = job.clone();
            }
        }
    }

    /// Takes ownership of a job that reached a terminal state.
    pub fn finish(&self, job: Job) {
        debug_assert!(job.status.is_terminal());
        {
            let mut entries = self.lock();
            match entries.get_mut(&job.id) {
                Some(entry) => {
                    // Release anything still waiting on this job, such as its timeout.
                    entry.cancel.cancel();
                    entry.job = job;
                }
                None => {
                    let cancel = CancellationToken::new();
                    cancel.cancel();
                    entries.insert(
                        job.id,
                        Entry {
                            order: self.next_order.fetch_add(1, Ordering::Relaxed),
                            job,
                            cancel,
                            reason: None,
                        },
                    );
                }
            }
        }
        self.finished.send_modify(|generation| *generation += 1);
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.lock().get(&id).map(|entry| entry.job.clone())
    }

    pub fn token(&self, id: JobId) -> Option<CancellationToken> {
        self.lock().get(&id).map(|entry| entry.cancel.clone())
    }

    pub fn cancel_reason(&self, id: JobId) -> Option<CancelReason> {
        self.lock().get(&id).and_then(|entry| entry.reason)
    }

    /// Fires the job's cancellation token. Returns `Ok(false)` if the job had
    /// already finished. The first reason recorded wins.
    pub fn request_cancel(&self, id: JobId, reason: CancelReason) -> Result<bool, Error> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id).ok_or(Error::NotFound(id))?;
        if entry.job.status.is_terminal() {
            return Ok(false);
        }
        entry.reason.get_or_insert(reason);
        entry.cancel.cancel();
        Ok(true)
    }

    /// Snapshots, oldest submission first, optionally filtered by status.
    pub fn list(&self, status: Option<Status>) -> Vec<Job> {
        let mut jobs: Vec<(u64, Job)> = self
            .lock()
            .values()
            .filter(|entry| status.map_or(true, |s| entry.job.status == s))
            .map(|entry| (entry.order, entry.job.clone()))
            .collect();
        jobs.sort_by_key(|(order, _)| *order);
        jobs.into_iter().map(|(_, job)| job).collect()
    }

    pub fn counts(&self) -> TerminalCounts {
        let mut counts = TerminalCounts::default();
        for entry in self.lock().values() {
            match entry.job.status {
                Status::Completed => counts.completed += 1,
                Status::Failed => counts.failed += 1,
                Status::Cancelled => counts.cancelled += 1,
                Status::Queued | Status::Active | Status::Retrying => {}
            }
        }
        counts
    }

    /// Resolves with the final snapshot once the job is terminal.
    pub async fn wait(&self, id: JobId) -> Result<Job, Error> {
        let mut finished = self.finished.subscribe();
        loop {
            match self.get(id) {
                None => return Err(Error::NotFound(id)),
                Some(job) if job.status.is_terminal() => return Ok(job),
                Some(_) => {}
            }
            if finished.changed().await.is_err() {
                return Err(Error::NotFound(id));
            }
        }
    }
}
