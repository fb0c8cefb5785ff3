//! Live progress per URL, shared by workers (writers) and any number of readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    Queued,
    Downloading,
    Postprocessing,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressStatus {
    fn is_in_flight(self) -> bool {
        matches!(self, ProgressStatus::Downloading | ProgressStatus::Postprocessing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub url: String,
    pub status: ProgressStatus,
    /// 0 to 100.
    pub percent_complete: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub eta_seconds: Option<u64>,
    pub speed_bytes_per_sec: Option<f64>,
    pub filename: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(url: impl Into<String>, status: ProgressStatus) -> Self {
        Self {
            url: url.into(),
            status,
            percent_complete: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            eta_seconds: None,
            speed_bytes_per_sec: None,
            filename: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Byte-level progress; the percentage is derived when the total is known.
    pub fn downloading(url: impl Into<String>, downloaded: u64, total: Option<u64>) -> Self {
        let mut snapshot = Self::new(url, ProgressStatus::Downloading);
        snapshot.downloaded_bytes = downloaded;
        snapshot.total_bytes = total;
        if let Some(total) = total.filter(|t| *t > 0) {
            snapshot.percent_complete = (downloaded as f64 / total as f64 * 100.0).min(100.0);
        }
        snapshot
    }

    pub fn with_percent(mut self, percent: f64) -> Self {
        self.percent_complete = percent;
        self
    }

    pub fn with_eta(mut self, secs: u64) -> Self {
        self.eta_seconds = Some(secs);
        self
    }

    pub fn with_speed(mut self, bytes_per_sec: f64) -> Self {
        self.speed_bytes_per_sec = Some(bytes_per_sec);
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Push-style progress callback. Errors and panics are logged and swallowed.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot) -> anyhow::Result<()>;
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressSnapshot) -> anyhow::Result<()> + Send + Sync,
{
    fn on_progress(&self, snapshot: &ProgressSnapshot) -> anyhow::Result<()> {
        self(snapshot)
    }
}

/// Returned by [`ProgressTable::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

type ObserverList = Vec<(ObserverHandle, Arc<dyn ProgressObserver>)>;

#[derive(Default)]
struct Inner {
    entries: RwLock<HashMap<String, ProgressSnapshot>>,
    observers: RwLock<ObserverList>,
    next_observer: AtomicU64,
}

/// Cheap to clone; all clones share one table.
#[derive(Clone, Default)]
pub struct ProgressTable {
    inner: Arc<Inner>,
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the entry for `snapshot.url`, then notifies observers.
    pub fn update(&self, snapshot: ProgressSnapshot) {
        self.inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.url.clone(), snapshot.clone());
        self.notify(&snapshot);
    }

    pub fn get(&self, url: &str) -> Option<ProgressSnapshot> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    /// Point-in-time copy of every entry.
    pub fn get_all(&self) -> HashMap<String, ProgressSnapshot> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self, observer: impl ProgressObserver + 'static) -> ObserverHandle {
        let handle = ObserverHandle(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, Arc::new(observer)));
        handle
    }

    /// Returns false if the handle was not registered.
    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        let mut observers = self
            .inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(h, _)| *h != handle);
        observers.len() != before
    }

    fn notify(&self, snapshot: &ProgressSnapshot) {
        // Observers run without any table lock held so they may read the table.
        let observers: ObserverList = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (handle, observer) in observers {
            match catch_unwind(AssertUnwindSafe(|| observer.on_progress(snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(observer = ?handle, url = %snapshot.url, error = %err, "progress observer failed")
                }
                Err(_) => warn!(observer = ?handle, url = %snapshot.url, "progress observer panicked"),
            }
        }
    }
}

struct SinkState {
    high_water: f64,
    open: bool,
}

/// Handed to the retriever for one attempt on one URL.
///
/// Reports may only carry in-flight statuses (DOWNLOADING or POSTPROCESSING);
/// anything else is recorded as DOWNLOADING. The percentage never goes
/// backwards within the attempt. Once the attempt is over the sink is closed
/// and further reports are dropped, so a retriever that ignores cancellation
/// cannot overwrite the final snapshot.
#[derive(Clone)]
pub struct ProgressSink {
    table: ProgressTable,
    url: Arc<str>,
    state: Arc<Mutex<SinkState>>,
}

impl ProgressSink {
    pub fn new(table: ProgressTable, url: impl Into<String>) -> Self {
        Self {
            table,
            url: Arc::from(url.into()),
            state: Arc::new(Mutex::new(SinkState {
                high_water: 0.0,
                open: true,
            })),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn report(&self, mut snapshot: ProgressSnapshot) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.open {
            debug!(url = %self.url, "dropping progress report after attempt ended");
            return;
        }
        let percent = if snapshot.percent_complete.is_nan() {
            state.high_water
        } else {
            snapshot.percent_complete.clamp(0.0, 100.0).max(state.high_water)
        };
        state.high_water = percent;

        snapshot.url = self.url.to_string();
        snapshot.percent_complete = percent;
        if !snapshot.status.is_in_flight() {
            snapshot.status = ProgressStatus::Downloading;
        }
        snapshot.updated_at = Utc::now();
        self.table.update(snapshot);
    }

    pub(crate) fn close(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).open = false;
    }
}
