//! Admission queue end-to-end behaviour on tokio's paused clock
//!
//! Scenarios:
//! 1. Admission bound: the third submission to a size-2 queue is refused
//! 2. Dispatch order: priority first, arrival order on ties
//! 3. Pacing: no more than `max_rate` dispatches per window
//! 4. Failure handling: re-queue while attempts remain, then dead-letter
//! 5. Scaling: the pool grows under sustained load and shrinks when idle
//! 6. Lifecycle: start is idempotent, stop drains and refuses new work

use async_trait::async_trait;
use keel_core_resilience::{FailureReason, ResilienceError, SharedDeadLetterQueue};
use keel_leveler::{AdmissionQueue, LevelingPolicy, ScalingDecision, Task, TaskHandler, TaskId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

const POLL: Duration = Duration::from_millis(10);

/// Records the order tasks were handled in
#[derive(Default)]
struct Recorder {
    order: Mutex<Vec<u64>>,
}

#[async_trait]
impl TaskHandler<&'static str> for Recorder {
    async fn handle(&self, task: &Task<&'static str>) -> Result<(), ResilienceError> {
        self.order.lock().unwrap().push(task.id.0);
        Ok(())
    }
}

/// Fails each task `failures` times before succeeding
struct Flaky {
    failures: u32,
    seen: Mutex<HashMap<TaskId, u32>>,
}

impl Flaky {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            seen: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TaskHandler<u32> for Flaky {
    async fn handle(&self, task: &Task<u32>) -> Result<(), ResilienceError> {
        let mut seen = self.seen.lock().unwrap();
        let count = seen.entry(task.id).or_insert(0);
        *count += 1;
        if *count <= self.failures {
            Err(ResilienceError::Http {
                status: 503,
                message: "Service Unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Blocks every task until the test opens the gate
struct Gated {
    gate: Arc<Semaphore>,
    started: AtomicUsize,
}

#[async_trait]
impl TaskHandler<()> for Gated {
    async fn handle(&self, _task: &Task<()>) -> Result<(), ResilienceError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| ResilienceError::Transient(e.to_string()))?;
        permit.forget();
        Ok(())
    }
}

fn single_worker() -> LevelingPolicy {
    LevelingPolicy {
        initial_workers: 1,
        min_workers: 1,
        max_workers: 1,
        auto_scale: false,
        max_rate: 100,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_third_submission_rejected_when_full() {
    let leveler = AdmissionQueue::new(
        LevelingPolicy::with_queue_size(2),
        Arc::new(Recorder::default()),
    )
    .unwrap();

    assert_ok!(leveler.submit_task("a", 0));
    assert_ok!(leveler.submit_task("b", 0));
    let err = assert_err!(leveler.submit_task("c", 0));

    assert!(matches!(err, ResilienceError::QueueFull { capacity: 2 }));
    assert!(err.is_backpressure());
    assert_eq!(leveler.queue_size(), 2);

    let status = leveler.system_status();
    assert_eq!(status.stats.submitted, 2);
    assert_eq!(status.stats.rejected, 1);
    assert!(!status.running);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_follows_priority_then_arrival() -> anyhow::Result<()> {
    let recorder = Arc::new(Recorder::default());
    let leveler = AdmissionQueue::new(single_worker(), recorder.clone())?;

    let low = leveler.submit_task("low", 0)?;
    let high_first = leveler.submit_task("high-1", 5)?;
    let mid = leveler.submit_task("mid", 1)?;
    let high_second = leveler.submit_task("high-2", 5)?;

    leveler.start();
    leveler.wait_until_idle(POLL).await;
    leveler.stop().await;

    let order = recorder.order.lock().unwrap().clone();
    assert_eq!(order, vec![high_first.0, high_second.0, mid.0, low.0]);
    assert_eq!(leveler.system_status().stats.completed, 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_is_rate_limited() -> anyhow::Result<()> {
    let policy = LevelingPolicy {
        max_rate: 2,
        rate_window_ms: 1000,
        initial_workers: 3,
        min_workers: 1,
        max_workers: 3,
        auto_scale: false,
        ..Default::default()
    };
    let recorder = Arc::new(Recorder::default());
    let leveler = AdmissionQueue::new(policy, recorder.clone())?;

    for _ in 0..6 {
        leveler.submit_task("job", 0)?;
    }

    let start = Instant::now();
    leveler.start();
    leveler.wait_until_idle(POLL).await;
    let elapsed = start.elapsed();
    leveler.stop().await;

    // 2 tasks in each of the windows starting at 0s, 1s and 2s
    assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);
    assert_eq!(recorder.order.lock().unwrap().len(), 6);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_tasks_retry_then_dead_letter() -> anyhow::Result<()> {
    let dlq = SharedDeadLetterQueue::new(10);
    let policy = LevelingPolicy {
        max_task_attempts: 2,
        ..single_worker()
    };
    let leveler = AdmissionQueue::with_dead_letter_sink(
        policy,
        Arc::new(Flaky::new(u32::MAX)),
        Arc::new(dlq.clone()),
    )?;

    let id = leveler.submit_task(7, 3)?;
    leveler.start();
    leveler.wait_until_idle(POLL).await;
    leveler.stop().await;

    let stats = leveler.system_status().stats;
    assert_eq!(stats.dispatched, 2);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);

    let entries = dlq.drain();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].context.operation_id, id.to_string());
    assert_eq!(entries[0].failure_reason, FailureReason::TaskFailed { attempts: 2 });
    assert_eq!(
        entries[0].context.labels.get("priority").map(String::as_str),
        Some("3")
    );
    assert!(entries[0].last_error.contains("503"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retries_bypass_admission_bound() -> anyhow::Result<()> {
    let policy = LevelingPolicy {
        max_queue_size: 1,
        max_task_attempts: 3,
        ..single_worker()
    };
    let leveler = AdmissionQueue::new(policy, Arc::new(Flaky::new(1)))?;

    leveler.submit_task(1, 0)?;
    leveler.start();
    leveler.wait_until_idle(POLL).await;
    leveler.stop().await;

    let stats = leveler.system_status().stats;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.failed, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_pool_scales_up_under_load_and_down_when_idle() -> anyhow::Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let handler = Arc::new(Gated {
        gate: gate.clone(),
        started: AtomicUsize::new(0),
    });
    let policy = LevelingPolicy {
        initial_workers: 2,
        min_workers: 1,
        max_workers: 4,
        max_rate: 1000,
        lookback_samples: 1,
        // Keep the background monitor out of the way; ticks are driven by hand
        monitor_interval_ms: 3_600_000,
        ..Default::default()
    };
    let leveler = AdmissionQueue::new(policy, handler.clone())?;

    for _ in 0..20 {
        leveler.submit_task((), 0)?;
    }
    leveler.start();
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Both workers blocked, 18 queued
    assert_eq!(handler.started.load(Ordering::SeqCst), 2);
    assert_eq!(leveler.run_monitor_tick(), ScalingDecision::ScaleUp);
    assert_eq!(leveler.system_status().workers.total, 3);

    // Release everything and let the queue drain
    gate.add_permits(1000);
    leveler.wait_until_idle(POLL).await;

    assert_eq!(leveler.run_monitor_tick(), ScalingDecision::ScaleDown);
    assert_eq!(leveler.run_monitor_tick(), ScalingDecision::ScaleDown);
    assert_eq!(leveler.run_monitor_tick(), ScalingDecision::Hold);

    let status = leveler.system_status();
    assert_eq!(status.workers.total, 1);
    assert_eq!(status.stats.scale_ups, 1);
    assert_eq!(status.stats.scale_downs, 2);
    assert_eq!(status.stats.completed, 20);

    leveler.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_drains_in_flight_and_refuses_new_work() -> anyhow::Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let handler = Arc::new(Gated {
        gate: gate.clone(),
        started: AtomicUsize::new(0),
    });
    let leveler = Arc::new(AdmissionQueue::new(single_worker(), handler.clone())?);

    leveler.submit_task((), 0)?;
    leveler.submit_task((), 0)?;
    leveler.start();
    leveler.start(); // No-op
    assert!(leveler.is_running());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(handler.started.load(Ordering::SeqCst), 1);

    let stopping = {
        let leveler = leveler.clone();
        tokio::spawn(async move { leveler.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopping.is_finished(), "stop must wait for the running task");

    gate.add_permits(1);
    stopping.await?;

    assert!(!leveler.is_running());
    let status = leveler.system_status();
    assert_eq!(status.stats.completed, 1);
    // The second task was never dispatched and is still queued
    assert_eq!(status.queue_size, 1);

    assert!(matches!(leveler.submit_task((), 0), Err(ResilienceError::Shutdown)));

    // Restarting resumes the queued task
    gate.add_permits(1);
    leveler.start();
    leveler.wait_until_idle(POLL).await;
    leveler.stop().await;
    assert_eq!(leveler.system_status().stats.completed, 2);
    Ok(())
}

#[tokio::test]
async fn test_invalid_policy_rejected() {
    let policy = LevelingPolicy {
        min_workers: 5,
        max_workers: 2,
        ..Default::default()
    };

    let result = AdmissionQueue::new(policy, Arc::new(Recorder::default()));
    assert!(matches!(result, Err(ResilienceError::Config(_))));
}
