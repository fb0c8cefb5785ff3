use anyhow::Error;
use async_trait::async_trait;
use clap::Parser;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use mediaq::{
    telemetry, JobEvent, JobRequest, Options, Priority, ProgressSink, ProgressSnapshot,
    RetrievalError, RetrievalResult, Retriever, Scheduler, SchedulerConfig,
};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Schedule media retrieval jobs against a simulated engine")]
pub struct ConfigContext {
    #[arg(help = "URLs to retrieve; a demo set is used when none are given")]
    urls: Vec<String>,

    #[arg(
        short = 'n',
        long = "number_active",
        env = "MEDIAQ_MAX_CONCURRENT",
        help = "Number of Active Jobs in Parallel",
        default_value = "3"
    )]
    num: usize,

    #[arg(
        short = 'p',
        long,
        env = "MEDIAQ_PRIORITY",
        help = "Priority for submitted jobs (low, normal, high, urgent)",
        default_value = "normal"
    )]
    priority: Priority,

    #[arg(long, env = "MEDIAQ_MAX_ATTEMPTS", default_value = "3")]
    max_attempts: u32,

    #[arg(long, env = "MEDIAQ_BACKOFF_MS", default_value = "500")]
    backoff_ms: u64,

    #[arg(long, env = "MEDIAQ_MAX_BACKOFF_MS", default_value = "30000")]
    max_backoff_ms: u64,

    #[arg(long, env = "MEDIAQ_TIMEOUT_SECS", help = "Per-job wall-clock limit")]
    timeout_secs: Option<u64>,

    #[arg(long, env = "MEDIAQ_JAEGER_ENDPOINT", help = "Jaeger collector URL for span export")]
    jaeger_endpoint: Option<String>,
}

impl ConfigContext {
    fn scheduler_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig::default()
            .with_max_concurrent(self.num)
            .with_max_attempts(self.max_attempts)
            .with_backoff(
                Duration::from_millis(self.backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
            );
        if let Some(secs) = self.timeout_secs {
            config = config.with_job_timeout(Duration::from_secs(secs));
        }
        config
    }
}

/// Stand-in engine: "downloads" in ten steps. URLs containing `flaky` fail
/// their first attempt with a transient error, URLs containing `broken`
/// fail permanently.
#[derive(Default)]
struct SimulatedRetriever {
    attempts: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl Retriever for SimulatedRetriever {
    async fn retrieve(
        &self,
        url: &str,
        _options: &Options,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<RetrievalResult, RetrievalError> {
        let attempt = {
            let mut attempts = self
                .attempts
                .lock()
                .map_err(|_| RetrievalError::permanent("attempt counter poisoned"))?;
            let n = attempts.entry(url.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        if url.contains("broken") {
            return Err(RetrievalError::permanent("unsupported source"));
        }

        let total = 10 * 1024 * 1024;
        for step in 1..=10u64 {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetrievalError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(100)) => {},
            }
            if url.contains("flaky") && attempt == 1 && step == 4 {
                return Err(RetrievalError::transient("connection reset by peer"));
            }
            progress.report(
                ProgressSnapshot::downloading(url, step * total / 10, Some(total))
                    .with_speed(total as f64)
                    .with_eta(((10 - step) as f64 * 0.1).ceil() as u64),
            );
        }

        let name = url.rsplit('/').next().unwrap_or("media");
        Ok(RetrievalResult::with_filename(format!("{name}.mp4")))
    }
}

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    // Channel for lifecycle events from the workers
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

    let scheduler = Scheduler::with_events(
        config.scheduler_config(),
        Arc::new(SimulatedRetriever::default()),
        send_to_client,
    )?;

    let urls = if config.urls.is_empty() {
        vec![
            "https://media.example/watch/alpha".to_string(),
            "https://media.example/watch/flaky-beta".to_string(),
            "https://media.example/watch/gamma".to_string(),
            "https://media.example/watch/broken-delta".to_string(),
            "https://media.example/watch/epsilon".to_string(),
        ]
    } else {
        config.urls.clone()
    };

    let mut pending = 0usize;
    for url in urls {
        let mut request = JobRequest::new(url.clone()).with_priority(config.priority);
        if let Some(secs) = config.timeout_secs {
            request = request.with_timeout(Duration::from_secs(secs));
        }
        match scheduler.submit_request(request) {
            Ok(id) => {
                debug!(job_id = %id, url = %url, "Submitted");
                pending += 1;
            }
            Err(err) => warn!(url = %url, error = %err, "Rejected"),
        }
    }
    scheduler.start()?;

    debug!("Done setting tasks");
    let mut interrupted = false;
    while pending > 0 {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Client Cancelled");
                interrupted = true;
                break;
            },
            event = recv_from_server.recv() => {
                match event {
                    Some(msg) => {
                        if matches!(
                            msg,
                            JobEvent::Completed { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled { .. }
                        ) {
                            pending -= 1;
                        }
                        info!(event = "Message", msg = ?msg);
                    },
                    None => {
                        debug!("Event channel closed unexpectedly, exiting");
                        break;
                    }
                }
            }
        }
    }

    println!("Waiting for scheduler to shutdown...");
    scheduler.shutdown(!interrupted).await;

    info!(status = ?scheduler.pool_status(), "Final pool status");
    for job in scheduler.jobs(None) {
        println!("{}", serde_json::to_string(&job)?);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "mediaq=debug");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
