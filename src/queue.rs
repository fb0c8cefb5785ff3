//! Priority-ordered pending queue shared by the scheduler and its workers.
//!
//! Jobs leave in order of priority (URGENT first) and, within a tier, in the
//! order they were pushed. Every push stamps a fresh sequence number, so a
//! retried job lines up behind everything enqueued before the retry.

use crate::{Error, Job, JobId};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

struct Entry(Job);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
    /// Jobs waiting out a retry backoff that will come back through `requeue`.
    deferred: usize,
    /// No new submissions; dequeuers are released once nothing is left.
    draining: bool,
    /// Forced stop: dequeuers are released immediately.
    closed: bool,
}

impl State {
    fn push(&mut self, mut job: Job) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        job.sequence = sequence;
        self.heap.push(Entry(job));
        sequence
    }

    fn exhausted(&self) -> bool {
        self.closed || (self.draining && self.heap.is_empty() && self.deferred == 0)
    }
}

#[derive(Default)]
pub struct PriorityQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accepts a new job and returns the sequence number it was given.
    /// Fails once the queue is draining or closed.
    pub fn enqueue(&self, job: Job) -> Result<u64, Error> {
        let sequence = {
            let mut state = self.lock();
            if state.draining || state.closed {
                return Err(Error::PoolShutdown);
            }
            debug!(job_id = %job.id, priority = %job.priority, "enqueue");
            state.push(job)
        };
        self.notify.notify_one();
        Ok(sequence)
    }

    /// Waits for the next job. Returns `None` once the queue is closed, or
    /// drained with nothing pending or deferred.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(Entry(job)) = state.heap.pop() {
                    let more = !state.heap.is_empty();
                    let exhausted = state.exhausted();
                    drop(state);
                    if more {
                        // Pass the baton in case several pushes coalesced into one permit.
                        self.notify.notify_one();
                    } else if exhausted {
                        // Last job of a drain: release every other parked dequeuer.
                        self.notify.notify_waiters();
                    }
                    return Some(job);
                }
                if state.exhausted() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Reserves a slot for a job entering backoff.
    pub fn defer(&self) {
        self.lock().deferred += 1;
    }

    /// Returns a deferred job to the queue. Allowed while draining so pending
    /// retries still run; refused after a forced close, handing the job back.
    pub fn requeue(&self, job: Job) -> Result<(), Job> {
        {
            let mut state = self.lock();
            state.deferred = state.deferred.saturating_sub(1);
            if state.closed {
                return Err(job);
            }
            debug!(job_id = %job.id, attempts = job.attempts, "requeue");
            state.push(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Releases a deferred slot whose job will not come back.
    pub fn abandon_deferred(&self) {
        let exhausted = {
            let mut state = self.lock();
            state.deferred = state.deferred.saturating_sub(1);
            state.exhausted()
        };
        if exhausted {
            self.notify.notify_waiters();
        }
    }

    /// Takes a pending job out of the queue.
    pub fn remove(&self, id: JobId) -> Option<Job> {
        let (removed, exhausted) = {
            let mut state = self.lock();
            let mut removed = None;
            let kept: Vec<Entry> = std::mem::take(&mut state.heap)
                .into_vec()
                .into_iter()
                .filter_map(|entry| {
                    if removed.is_none() && entry.0.id == id {
                        removed = Some(entry.0);
                        None
                    } else {
                        Some(entry)
                    }
                })
                .collect();
            state.heap = BinaryHeap::from(kept);
            (removed, state.exhausted())
        };
        if exhausted {
            self.notify.notify_waiters();
        }
        removed
    }

    /// Stops accepting jobs; workers keep dequeuing until nothing is left.
    pub fn drain(&self) {
        self.lock().draining = true;
        self.notify.notify_waiters();
    }

    /// Stops immediately, returning whatever was still pending in dispatch order.
    pub fn close(&self) -> Vec<Job> {
        let pending = {
            let mut state = self.lock();
            state.draining = true;
            state.closed = true;
            std::mem::take(&mut state.heap)
                .into_sorted_vec()
                .into_iter()
                .rev()
                .map(|Entry(job)| job)
                .collect()
        };
        self.notify.notify_waiters();
        pending
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs currently waiting out a backoff.
    pub fn deferred(&self) -> usize {
        self.lock().deferred
    }

    pub fn is_accepting(&self) -> bool {
        let state = self.lock();
        !state.draining && !state.closed
    }
}
