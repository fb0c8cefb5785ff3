#![allow(dead_code)]

use async_trait::async_trait;
use mediaq::{
    Options, ProgressSink, ProgressSnapshot, ProgressStatus, RetrievalError, RetrievalResult,
    Retriever, SchedulerConfig,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// What one retrieval attempt for a URL should do.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Transient(&'static str),
    Permanent(&'static str),
    Panic,
    /// Wait for cancellation, then report it.
    Hang,
    /// Ignore cancellation, succeed after the given delay.
    Stubborn(Duration),
    /// Wait for a permit from [`ScriptedRetriever::release`], then succeed.
    Gated,
}

/// Retriever driven by per-URL scripts. URLs without a script succeed.
pub struct ScriptedRetriever {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    gate: Semaphore,
}

impl ScriptedRetriever {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        }
    }

    pub fn script(self, url: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), steps.into_iter().collect());
        self
    }

    /// URLs in the order their attempts started.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of attempts observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn next_step(&self, url: &str) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Succeed)
    }

    async fn run(
        &self,
        url: &str,
        step: Step,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RetrievalResult, RetrievalError> {
        match step {
            Step::Succeed => {
                for percent in [25.0, 50.0, 100.0] {
                    progress.report(
                        ProgressSnapshot::new(url, ProgressStatus::Downloading).with_percent(percent),
                    );
                    tokio::task::yield_now().await;
                }
                Ok(RetrievalResult::with_filename(format!("{url}.mp4")))
            }
            Step::Transient(msg) => {
                progress.report(
                    ProgressSnapshot::new(url, ProgressStatus::Downloading).with_percent(40.0),
                );
                Err(RetrievalError::transient(msg))
            }
            Step::Permanent(msg) => Err(RetrievalError::permanent(msg)),
            Step::Panic => panic!("retriever exploded on {url}"),
            Step::Hang => {
                cancel.cancelled().await;
                Err(RetrievalError::Cancelled)
            }
            Step::Stubborn(delay) => {
                tokio::time::sleep(delay).await;
                progress.report(
                    ProgressSnapshot::new(url, ProgressStatus::Downloading).with_percent(100.0),
                );
                Ok(RetrievalResult::with_filename("late.mp4"))
            }
            Step::Gated => {
                tokio::select! {
                    permit = self.gate.acquire() => {
                        if let Ok(permit) = permit {
                            permit.forget();
                        }
                        Ok(RetrievalResult::with_filename(format!("{url}.mp4")))
                    }
                    _ = cancel.cancelled() => Err(RetrievalError::Cancelled),
                }
            }
        }
    }
}

#[async_trait]
impl Retriever for ScriptedRetriever {
    async fn retrieve(
        &self,
        url: &str,
        _options: &Options,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<RetrievalResult, RetrievalError> {
        self.calls.lock().unwrap().push(url.to_string());
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let step = self.next_step(url);
        let result = self.run(url, step, &progress, &cancel).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Tiny backoff so retry tests run fast.
pub fn fast_config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_max_concurrent(max_concurrent)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
