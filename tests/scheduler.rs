mod common;

use common::{fast_config, wait_until, ScriptedRetriever, Step};
use mediaq::{
    Error, JobEvent, JobRequest, Options, Priority, ProgressSnapshot, ProgressStatus, Scheduler,
    SchedulerConfig, Status,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn scheduler(config: SchedulerConfig, retriever: &Arc<ScriptedRetriever>) -> Scheduler {
    Scheduler::new(config, Arc::clone(retriever) as Arc<dyn mediaq::Retriever>).unwrap()
}

async fn finished(scheduler: &Scheduler, id: mediaq::JobId) -> mediaq::Job {
    timeout(Duration::from_secs(2), scheduler.wait(id))
        .await
        .expect("job did not finish in time")
        .unwrap()
}

#[tokio::test]
async fn dispatches_by_priority_then_submission_order() {
    let retriever = Arc::new(ScriptedRetriever::new());
    let scheduler = scheduler(fast_config(1), &retriever);

    let ids = [
        scheduler.submit("low", Options::new(), Priority::Low).unwrap(),
        scheduler.submit("normal-1", Options::new(), Priority::Normal).unwrap(),
        scheduler.submit("urgent", Options::new(), Priority::Urgent).unwrap(),
        scheduler.submit("normal-2", Options::new(), Priority::Normal).unwrap(),
        scheduler.submit("high", Options::new(), Priority::High).unwrap(),
    ];
    assert_eq!(scheduler.status(ids[0]).unwrap().status, Status::Queued);
    scheduler.start().unwrap();

    for id in ids {
        assert_eq!(finished(&scheduler, id).await.status, Status::Completed);
    }
    assert_eq!(
        retriever.calls(),
        ["urgent", "high", "normal-1", "normal-2", "low"]
    );
    scheduler.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_runs_more_than_max_concurrent() {
    let retriever = Arc::new(
        (0..5).fold(ScriptedRetriever::new(), |r, i| {
            r.script(&format!("job-{i}"), [Step::Gated])
        }),
    );
    let scheduler = scheduler(fast_config(2), &retriever);
    let ids: Vec<_> = (0..5)
        .map(|i| {
            scheduler
                .submit(format!("job-{i}"), Options::new(), Priority::Normal)
                .unwrap()
        })
        .collect();
    scheduler.start().unwrap();

    wait_until(|| {
        let status = scheduler.pool_status();
        status.active == 2 && status.queued == 3
    })
    .await;
    assert_eq!(scheduler.jobs(Some(Status::Active)).len(), 2);
    assert_eq!(scheduler.pool_status().max_concurrent, 2);

    retriever.release(5);
    for id in ids {
        assert_eq!(finished(&scheduler, id).await.status, Status::Completed);
    }
    assert_eq!(retriever.peak(), 2);
    let status = scheduler.pool_status();
    assert_eq!((status.active, status.queued, status.completed), (0, 0, 5));
    scheduler.shutdown(true).await;
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let retriever = Arc::new(ScriptedRetriever::new().script(
        "flaky",
        [Step::Transient("reset by peer"), Step::Transient("throttled"), Step::Succeed],
    ));
    let scheduler = scheduler(fast_config(1), &retriever);
    scheduler.start().unwrap();

    let id = scheduler
        .submit("flaky", Options::new(), Priority::High)
        .unwrap();
    let job = finished(&scheduler, id).await;
    assert_eq!(job.status, Status::Completed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.priority, Priority::High);
    assert!(job.last_error.is_none());
    assert_eq!(
        job.result.and_then(|r| r.filename).as_deref(),
        Some("flaky.mp4")
    );
    scheduler.shutdown(true).await;
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let retriever =
        Arc::new(ScriptedRetriever::new().script("gone", [Step::Permanent("video removed")]));
    let scheduler = scheduler(fast_config(1), &retriever);
    scheduler.start().unwrap();

    let id = scheduler
        .submit("gone", Options::new(), Priority::Normal)
        .unwrap();
    let job = finished(&scheduler, id).await;
    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("video removed"));
    assert_eq!(
        scheduler.progress("gone").unwrap().status,
        ProgressStatus::Failed
    );
    assert_eq!(scheduler.pool_status().failed, 1);
    scheduler.shutdown(true).await;
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let retriever = Arc::new(
        ScriptedRetriever::new()
            .script(
                "always-down",
                [
                    Step::Transient("first"),
                    Step::Transient("second"),
                    Step::Transient("third"),
                    Step::Succeed,
                ],
            )
            .script("single-shot", [Step::Transient("once")]),
    );
    let scheduler = scheduler(fast_config(2), &retriever);
    scheduler.start().unwrap();

    let down = scheduler
        .submit("always-down", Options::new(), Priority::Normal)
        .unwrap();
    let single = scheduler
        .submit_request(JobRequest::new("single-shot").with_max_attempts(1))
        .unwrap();

    let job = finished(&scheduler, down).await;
    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.attempts, 3);
    assert!(job.last_error.unwrap().contains("third"));

    let job = finished(&scheduler, single).await;
    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.attempts, 1);
    scheduler.shutdown(true).await;
}

#[tokio::test]
async fn retried_job_waits_behind_earlier_jobs_of_its_tier() {
    let retriever = Arc::new(ScriptedRetriever::new().script("a", [Step::Transient("blip")]));
    let scheduler = scheduler(fast_config(1), &retriever);
    let a = scheduler.submit("a", Options::new(), Priority::Normal).unwrap();
    let b = scheduler.submit("b", Options::new(), Priority::Normal).unwrap();
    scheduler.start().unwrap();

    finished(&scheduler, a).await;
    finished(&scheduler, b).await;
    assert_eq!(retriever.calls(), ["a", "b", "a"]);
    assert_eq!(scheduler.status(a).unwrap().priority, Priority::Normal);
    scheduler.shutdown(true).await;
}

#[tokio::test]
async fn progress_is_monotonic_per_attempt_and_ends_complete() {
    let retriever =
        Arc::new(ScriptedRetriever::new().script("clip", [Step::Transient("reset"), Step::Succeed]));
    let scheduler = scheduler(fast_config(1), &retriever);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    scheduler.subscribe_progress(move |snap: &ProgressSnapshot| -> anyhow::Result<()> {
        log.lock()
            .unwrap()
            .push((snap.status, snap.percent_complete));
        Ok(())
    });
    scheduler.start().unwrap();

    let id = scheduler.submit("clip", Options::new(), Priority::Normal).unwrap();
    finished(&scheduler, id).await;

    let seen = seen.lock().unwrap().clone();
    assert!(seen.iter().any(|(s, _)| *s == ProgressStatus::Retrying));
    for attempt in seen.split(|(s, _)| *s != ProgressStatus::Downloading) {
        assert!(
            attempt.windows(2).all(|w| w[0].1 <= w[1].1),
            "percent went backwards: {attempt:?}"
        );
    }
    assert_eq!(seen.last(), Some(&(ProgressStatus::Completed, 100.0)));

    let snap = scheduler.progress("clip").unwrap();
    assert_eq!(snap.status, ProgressStatus::Completed);
    assert_eq!(snap.percent_complete, 100.0);
    assert_eq!(snap.filename.as_deref(), Some("clip.mp4"));
    assert!(scheduler.progress_all().contains_key("clip"));
    assert!(matches!(
        scheduler.progress("never-submitted"),
        Err(Error::ProgressNotFound(_))
    ));
    scheduler.shutdown(true).await;
}

#[tokio::test]
async fn failing_observer_does_not_disturb_the_job() {
    let retriever = Arc::new(ScriptedRetriever::new());
    let scheduler = scheduler(fast_config(1), &retriever);
    let handle = scheduler.subscribe_progress(|_: &ProgressSnapshot| -> anyhow::Result<()> {
        anyhow::bail!("observer is broken")
    });
    scheduler.start().unwrap();

    let id = scheduler.submit("a", Options::new(), Priority::Normal).unwrap();
    assert_eq!(finished(&scheduler, id).await.status, Status::Completed);
    assert!(scheduler.unsubscribe_progress(handle));
    scheduler.shutdown(true).await;
}

#[tokio::test]
async fn cancelling_a_queued_job_removes_it() {
    let retriever = Arc::new(ScriptedRetriever::new());
    let scheduler = scheduler(fast_config(1), &retriever);
    let keep = scheduler.submit("keep", Options::new(), Priority::Normal).unwrap();
    let dropped = scheduler.submit("drop", Options::new(), Priority::Normal).unwrap();

    assert!(scheduler.cancel(dropped).unwrap());
    assert_eq!(scheduler.status(dropped).unwrap().status, Status::Cancelled);
    assert_eq!(scheduler.pool_status().queued, 1);
    assert!(!scheduler.cancel(dropped).unwrap());

    scheduler.start().unwrap();
    finished(&scheduler, keep).await;
    assert_eq!(retriever.calls(), ["keep"]);
    assert!(scheduler.progress("drop").is_err());
    scheduler.shutdown(true).await;
}

#[tokio::test]
async fn cancelling_an_active_job_frees_the_worker() {
    let retriever = Arc::new(ScriptedRetriever::new().script("slow", [Step::Hang]));
    let scheduler = scheduler(fast_config(1), &retriever);
    scheduler.start().unwrap();

    let slow = scheduler.submit("slow", Options::new(), Priority::Normal).unwrap();
    let next = scheduler.submit("next", Options::new(), Priority::Normal).unwrap();
    wait_until(|| scheduler.status(slow).unwrap().status == Status::Active).await;

    assert!(scheduler.cancel(slow).unwrap());
    assert_eq!(finished(&scheduler, slow).await.status, Status::Cancelled);
    assert_eq!(
        scheduler.progress("slow").unwrap().status,
        ProgressStatus::Cancelled
    );
    assert_eq!(finished(&scheduler, next).await.status, Status::Completed);
    assert!(!scheduler.cancel(slow).unwrap());
    scheduler.shutdown(true).await;
}

#[tokio::test]
async fn uncooperative_retriever_result_is_discarded() {
    let retriever = Arc::new(
        ScriptedRetriever::new().script("stubborn", [Step::Stubborn(Duration::from_millis(200))]),
    );
    let scheduler = scheduler(fast_config(1), &retriever);
    scheduler.start().unwrap();

    let id = scheduler.submit("stubborn", Options::new(), Priority::Normal).unwrap();
    wait_until(|| scheduler.status(id).unwrap().status == Status::Active).await;
    scheduler.cancel(id).unwrap();

    let job = timeout(Duration::from_millis(100), scheduler.wait(id))
        .await
        .expect("cancellation should not wait for the retriever")
        .unwrap();
    assert_eq!(job.status, Status::Cancelled);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(scheduler.status(id).unwrap().status, Status::Cancelled);
    assert_eq!(
        scheduler.progress("stubborn").unwrap().status,
        ProgressStatus::Cancelled
    );
    scheduler.shutdown(true).await;
}

#[tokio::test]
async fn timed_out_job_is_cancelled() {
    let retriever = Arc::new(ScriptedRetriever::new().script("hangs", [Step::Hang]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::with_events(
        fast_config(1),
        Arc::clone(&retriever) as Arc<dyn mediaq::Retriever>,
        tx,
    )
    .unwrap();
    scheduler.start().unwrap();

    let id = scheduler
        .submit_request(JobRequest::new("hangs").with_timeout(Duration::from_millis(30)))
        .unwrap();
    let job = finished(&scheduler, id).await;
    assert_eq!(job.status, Status::Cancelled);
    assert_eq!(job.timeout, Some(Duration::from_millis(30)));

    let mut reason = None;
    while let Ok(event) = rx.try_recv() {
        if let JobEvent::Cancelled { reason: r, .. } = event {
            reason = Some(r);
        }
    }
    assert!(reason.unwrap().contains("timed out"));
    scheduler.shutdown(true).await;
}

#[tokio::test]
async fn panicking_retriever_fails_the_job_not_the_pool() {
    let retriever = Arc::new(ScriptedRetriever::new().script("boom", [Step::Panic]));
    let scheduler = scheduler(fast_config(1), &retriever);
    scheduler.start().unwrap();

    let boom = scheduler.submit("boom", Options::new(), Priority::Urgent).unwrap();
    let after = scheduler.submit("after", Options::new(), Priority::Normal).unwrap();

    let job = finished(&scheduler, boom).await;
    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("worker fault"));
    assert_eq!(finished(&scheduler, after).await.status, Status::Completed);
    scheduler.shutdown(true).await;
}

#[tokio::test]
async fn rejects_invalid_submissions() {
    let retriever = Arc::new(ScriptedRetriever::new());
    let scheduler = scheduler(fast_config(1), &retriever);

    assert!(matches!(
        scheduler.submit("", Options::new(), Priority::Normal),
        Err(Error::InvalidInput(_))
    ));
    let results = scheduler.submit_batch(["a", "", "c"], Options::new(), Priority::High);
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(Error::InvalidInput(_))));
    assert!(results[2].is_ok());
    assert_eq!(scheduler.pool_status().queued, 2);

    let unknown = uuid::Uuid::new_v4();
    assert!(matches!(scheduler.status(unknown), Err(Error::NotFound(_))));
    assert!(matches!(scheduler.cancel(unknown), Err(Error::NotFound(_))));
    assert!(matches!(
        Scheduler::new(
            SchedulerConfig::default().with_max_concurrent(0),
            Arc::clone(&retriever) as Arc<dyn mediaq::Retriever>,
        ),
        Err(Error::InvalidConfig(_))
    ));
    scheduler.shutdown(false).await;
}

#[tokio::test]
async fn graceful_shutdown_finishes_accepted_work() {
    let retriever = Arc::new(
        ScriptedRetriever::new()
            .script("slow", [Step::Stubborn(Duration::from_millis(50))])
            .script("flaky", [Step::Transient("reset"), Step::Succeed]),
    );
    let scheduler = scheduler(fast_config(1), &retriever);
    let ids = scheduler
        .submit_batch(["slow", "flaky", "last"], Options::new(), Priority::Normal)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    scheduler.start().unwrap();

    timeout(Duration::from_secs(2), scheduler.shutdown(true))
        .await
        .expect("graceful shutdown hung");
    for id in &ids {
        assert_eq!(scheduler.status(*id).unwrap().status, Status::Completed);
    }
    assert_eq!(scheduler.status(ids[1]).unwrap().attempts, 2);
    assert!(matches!(
        scheduler.submit("late", Options::new(), Priority::Urgent),
        Err(Error::PoolShutdown)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_releases_every_worker_after_a_pending_retry() {
    let retriever =
        Arc::new(ScriptedRetriever::new().script("flaky", [Step::Transient("reset"), Step::Succeed]));
    let config = SchedulerConfig::default()
        .with_max_concurrent(2)
        .with_backoff(Duration::from_millis(100), Duration::from_millis(100));
    let scheduler = scheduler(config, &retriever);
    scheduler.start().unwrap();

    let id = scheduler.submit("flaky", Options::new(), Priority::Normal).unwrap();
    wait_until(|| {
        scheduler.status(id).unwrap().status == Status::Retrying
            && scheduler.pool_status().retrying == 1
    })
    .await;

    timeout(Duration::from_secs(2), scheduler.shutdown(true))
        .await
        .expect("graceful shutdown left a worker parked");
    let job = scheduler.status(id).unwrap();
    assert_eq!(job.status, Status::Completed);
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn forced_shutdown_cancels_everything_pending() {
    let retriever = Arc::new(ScriptedRetriever::new().script("running", [Step::Hang]));
    let scheduler = scheduler(fast_config(1), &retriever);
    scheduler.start().unwrap();

    let running = scheduler.submit("running", Options::new(), Priority::Normal).unwrap();
    let waiting = scheduler.submit("waiting", Options::new(), Priority::Normal).unwrap();
    wait_until(|| scheduler.status(running).unwrap().status == Status::Active).await;

    timeout(Duration::from_secs(2), scheduler.shutdown(false))
        .await
        .expect("forced shutdown hung");
    assert_eq!(scheduler.status(running).unwrap().status, Status::Cancelled);
    assert_eq!(scheduler.status(waiting).unwrap().status, Status::Cancelled);
    assert_eq!(retriever.calls(), ["running"]);
    assert_eq!(scheduler.pool_status().cancelled, 2);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let retriever = Arc::new(ScriptedRetriever::new());
    let scheduler = scheduler(fast_config(2), &retriever);
    scheduler.start().unwrap();
    let id = scheduler.submit("a", Options::new(), Priority::Normal).unwrap();

    scheduler.shutdown(true).await;
    scheduler.shutdown(true).await;
    scheduler.shutdown(false).await;

    assert_eq!(scheduler.status(id).unwrap().status, Status::Completed);
    assert!(matches!(scheduler.start(), Err(Error::PoolShutdown)));
    assert!(scheduler
        .submit_batch(["x", "y"], Options::new(), Priority::Low)
        .iter()
        .all(|r| matches!(r, Err(Error::PoolShutdown))));
}

#[tokio::test]
async fn shutdown_before_start_cancels_pending_jobs() {
    let retriever = Arc::new(ScriptedRetriever::new());
    let scheduler = scheduler(fast_config(1), &retriever);
    let id = scheduler.submit("a", Options::new(), Priority::Normal).unwrap();

    scheduler.shutdown(true).await;
    assert_eq!(scheduler.status(id).unwrap().status, Status::Cancelled);
    assert!(retriever.calls().is_empty());
}

#[tokio::test]
async fn events_follow_the_job_lifecycle() {
    let retriever =
        Arc::new(ScriptedRetriever::new().script("flaky", [Step::Transient("reset"), Step::Succeed]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::with_events(
        fast_config(1),
        Arc::clone(&retriever) as Arc<dyn mediaq::Retriever>,
        tx,
    )
    .unwrap();
    scheduler.start().unwrap();
    let id = scheduler.submit("flaky", Options::new(), Priority::Normal).unwrap();

    let mut events = Vec::new();
    while let Some(event) = timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
        assert_eq!(event.job_id(), id);
        let done = matches!(event, JobEvent::Completed { .. });
        events.push(event);
        if done {
            break;
        }
    }

    assert_eq!(events.len(), 4);
    assert_eq!(events[0], JobEvent::Started { id, attempt: 1 });
    assert!(matches!(
        &events[1],
        JobEvent::Retrying { attempt: 1, error, .. } if error.contains("reset")
    ));
    assert_eq!(events[2], JobEvent::Started { id, attempt: 2 });
    assert_eq!(
        events[3],
        JobEvent::Completed {
            id,
            filename: Some("flaky.mp4".into())
        }
    );
    scheduler.shutdown(true).await;
}
