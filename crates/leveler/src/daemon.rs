//! Admission Queue Daemon: dispatch and monitor loops
//!
//! This module owns the background loops that drain the queue into the
//! worker pool and resize the pool with observed load.

use crate::metrics::{LevelerStats, SystemStatus};
use crate::monitor::{LoadMonitor, LoadSample, ScalingDecision, ScalingThresholds};
use crate::policy::LevelingPolicy;
use crate::pool::WorkerPool;
use crate::queue::TaskQueue;
use crate::task::{Task, TaskHandler, TaskId};
use futures::FutureExt;
use keel_core_resilience::{
    DeadLetterEntry, DeadLetterSink, FailureReason, OperationContext, RateLimiter,
    ResilienceError, SharedDeadLetterQueue,
};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Operation name used for dead-lettered tasks
pub const TASK_OPERATION_NAME: &str = "leveled-task";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Queue-based load leveler
///
/// Buffers submitted tasks in a bounded priority queue and dispatches them
/// to a pool of workers at no more than `max_rate` tasks per `rate_window`.
/// A monitor loop samples queue depth and worker utilization and, with
/// `auto_scale`, grows or shrinks the pool within its bounds.
///
/// Tasks may be submitted before [`AdmissionQueue::start`]; they wait in the
/// queue until the loops run.
pub struct AdmissionQueue<P> {
    inner: Arc<Inner<P>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner<P> {
    policy: LevelingPolicy,
    handler: Arc<dyn TaskHandler<P>>,
    queue: Mutex<TaskQueue<P>>,
    pool: Mutex<WorkerPool>,
    monitor: Mutex<LoadMonitor>,
    stats: Mutex<LevelerStats>,
    limiter: RateLimiter,
    dead_letters: Arc<dyn DeadLetterSink>,
    next_id: AtomicU64,
    running: AtomicBool,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl<P: Send + Sync + 'static> AdmissionQueue<P> {
    /// Create a new admission queue with an in-memory dead-letter queue
    pub fn new(
        policy: LevelingPolicy,
        handler: Arc<dyn TaskHandler<P>>,
    ) -> Result<Self, ResilienceError> {
        Self::with_dead_letter_sink(policy, handler, Arc::new(SharedDeadLetterQueue::default()))
    }

    /// Create a new admission queue that reports failed tasks to `sink`
    ///
    /// Returns `Config` if the policy is invalid.
    pub fn with_dead_letter_sink(
        policy: LevelingPolicy,
        handler: Arc<dyn TaskHandler<P>>,
        sink: Arc<dyn DeadLetterSink>,
    ) -> Result<Self, ResilienceError> {
        policy.validate().map_err(ResilienceError::Config)?;

        let thresholds = ScalingThresholds {
            scale_up_queue: policy.scale_up_queue_threshold,
            scale_down_queue: policy.scale_down_queue_threshold,
            scale_up_utilization: policy.scale_up_utilization,
            scale_down_utilization: policy.scale_down_utilization,
        };
        let (shutdown, _) = watch::channel(false);

        let inner = Inner {
            queue: Mutex::new(TaskQueue::new(policy.max_queue_size)),
            pool: Mutex::new(WorkerPool::new(
                policy.initial_workers,
                policy.min_workers,
                policy.max_workers,
            )?),
            monitor: Mutex::new(LoadMonitor::new(thresholds, policy.lookback_samples)),
            stats: Mutex::new(LevelerStats::new()),
            limiter: RateLimiter::new(policy.max_rate, policy.rate_window()),
            dead_letters: sink,
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown,
            handler,
            policy,
        };

        Ok(Self {
            inner: Arc::new(inner),
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn policy(&self) -> &LevelingPolicy {
        &self.inner.policy
    }

    pub fn dead_letters(&self) -> Arc<dyn DeadLetterSink> {
        self.inner.dead_letters.clone()
    }

    /// Admit a task
    ///
    /// Fails with `QueueFull` when the queue holds `max_queue_size` tasks
    /// (the queue is left unchanged), and with `Shutdown` after `stop()`.
    pub fn submit_task(&self, payload: P, priority: i32) -> Result<TaskId, ResilienceError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(ResilienceError::Shutdown);
        }

        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let pushed = self.inner.lock_queue().push(Task::new(id, payload, priority));

        match pushed {
            Ok(()) => {
                self.inner.lock_stats().submitted += 1;
                debug!(task = %id, priority, "Task admitted");
                Ok(id)
            }
            Err(e) => {
                self.inner.lock_stats().rejected += 1;
                warn!(task = %id, error = %e, "Task rejected");
                Err(e)
            }
        }
    }

    /// Number of tasks waiting for a worker
    pub fn queue_size(&self) -> usize {
        self.inner.lock_queue().len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Spawn the dispatch and monitor loops
    ///
    /// Must be called from within a tokio runtime. Calling it while already
    /// running does nothing.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            debug!("Admission queue already running");
            return;
        }

        self.inner.shutdown.send_replace(false);
        self.inner.stopped.store(false, Ordering::Release);

        let policy = &self.inner.policy;
        info!(
            "🚦 Admission queue active | Capacity: {} | Rate: {}/{}ms | Workers: {} ({}..{}) | Auto-scale: {}",
            policy.max_queue_size,
            policy.max_rate,
            policy.rate_window_ms,
            policy.initial_workers,
            policy.min_workers,
            policy.max_workers,
            policy.auto_scale
        );

        let dispatch = tokio::spawn(Inner::dispatch_loop(
            self.inner.clone(),
            self.inner.shutdown.subscribe(),
        ));
        let monitor = tokio::spawn(Inner::monitor_loop(
            self.inner.clone(),
            self.inner.shutdown.subscribe(),
        ));

        *lock(&self.loops) = vec![dispatch, monitor];
    }

    /// Stop both loops and wait for in-flight tasks to finish
    ///
    /// Tasks still queued stay queued; `start()` resumes them.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }

        info!("🛑 Admission queue stopping, draining in-flight tasks");
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.shutdown.send_replace(true);

        let handles = std::mem::take(&mut *lock(&self.loops));
        for handle in handles {
            if let Err(e) = handle.await {
                error!("❌ Admission queue loop ended abnormally: {}", e);
            }
        }

        self.inner.running.store(false, Ordering::Release);
        info!("📊 {}", self.inner.lock_stats().summary());
    }

    /// Sample load and apply any scaling decision, as the monitor loop does
    ///
    /// Note: Public for integration testing
    pub fn run_monitor_tick(&self) -> ScalingDecision {
        self.inner.sample_and_scale()
    }

    /// Wait until the queue is empty and no worker is busy
    pub async fn wait_until_idle(&self, poll_interval: Duration) {
        loop {
            let queue_empty = self.inner.lock_queue().is_empty();
            let workers = self.inner.lock_pool().counts();
            if queue_empty && workers.busy == 0 && workers.retiring == 0 {
                return;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Snapshot of queue, pool, limiter and counters
    pub fn system_status(&self) -> SystemStatus {
        let inner = &self.inner;
        let (queue_size, queue_capacity) = {
            let queue = inner.lock_queue();
            (queue.len(), queue.capacity())
        };
        let (workers, utilization) = {
            let pool = inner.lock_pool();
            (pool.counts(), pool.utilization())
        };
        let (average_queue_size, average_utilization) = {
            let monitor = inner.lock_monitor();
            (monitor.average_queue_size(), monitor.average_utilization())
        };

        SystemStatus {
            running: self.is_running(),
            queue_size,
            queue_capacity,
            workers,
            utilization,
            available_tokens: inner.limiter.available_tokens(),
            average_queue_size,
            average_utilization,
            stats: inner.lock_stats().clone(),
        }
    }
}

impl<P> Drop for AdmissionQueue<P> {
    fn drop(&mut self) {
        // Loops hold their own Arc; tell them to exit
        self.inner.shutdown.send_replace(true);
    }
}

impl<P: Send + Sync + 'static> Inner<P> {
    fn lock_queue(&self) -> MutexGuard<'_, TaskQueue<P>> {
        lock(&self.queue)
    }

    fn lock_pool(&self) -> MutexGuard<'_, WorkerPool> {
        lock(&self.pool)
    }

    fn lock_monitor(&self) -> MutexGuard<'_, LoadMonitor> {
        lock(&self.monitor)
    }

    fn lock_stats(&self) -> MutexGuard<'_, LevelerStats> {
        lock(&self.stats)
    }

    async fn dispatch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.policy.process_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            while let Some(finished) = in_flight.try_join_next() {
                if let Err(e) = finished {
                    error!("❌ Worker task ended abnormally: {}", e);
                }
            }

            if !self.dispatch_pending(&mut in_flight, &mut shutdown).await {
                break;
            }
        }

        while let Some(finished) = in_flight.join_next().await {
            if let Err(e) = finished {
                error!("❌ Worker task ended abnormally: {}", e);
            }
        }
        debug!("Dispatch loop stopped");
    }

    /// Hand queued tasks to idle workers until one runs out.
    /// Returns false if shutdown was signalled while waiting for a token.
    async fn dispatch_pending(
        self: &Arc<Self>,
        in_flight: &mut JoinSet<()>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            if self.lock_queue().is_empty() {
                return true;
            }
            let Some(worker_id) = self.lock_pool().checkout_idle() else {
                return true;
            };

            tokio::select! {
                _ = self.limiter.acquire(self.policy.rate_poll_interval()) => {}
                _ = shutdown.changed() => {
                    self.lock_pool().release_unused(worker_id);
                    return false;
                }
            }

            let Some(mut task) = self.lock_queue().pop() else {
                self.lock_pool().release_unused(worker_id);
                return true;
            };

            task.begin_attempt();
            {
                let mut stats = self.lock_stats();
                stats.dispatched += 1;
                stats.total_wait += task.wait_time().unwrap_or_default();
            }
            debug!(task = %task.id, worker = worker_id, attempt = task.attempts, "Dispatching task");

            let inner = self.clone();
            in_flight.spawn(async move { inner.run_task(worker_id, task).await });
        }
    }

    async fn run_task(self: Arc<Self>, worker_id: u64, mut task: Task<P>) {
        let result = match AssertUnwindSafe(self.handler.handle(&task)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(ResilienceError::Permanent("task handler panicked".to_string())),
        };
        let processing = task
            .started_at
            .map(|started| started.elapsed())
            .unwrap_or_default();

        match result {
            Ok(()) => {
                task.complete();
                let mut stats = self.lock_stats();
                stats.completed += 1;
                stats.total_processing += processing;
                debug!(task = %task.id, worker = worker_id, "✅ Task completed");
            }
            Err(e) if task.attempts < self.policy.max_task_attempts => {
                task.reset_for_retry();
                {
                    let mut stats = self.lock_stats();
                    stats.retried += 1;
                    stats.total_processing += processing;
                }
                warn!(
                    task = %task.id,
                    attempt = task.attempts,
                    max_attempts = self.policy.max_task_attempts,
                    error = %e,
                    "⚠️  Task failed, re-queueing"
                );
                self.lock_queue().requeue(task);
            }
            Err(e) => {
                task.fail();
                {
                    let mut stats = self.lock_stats();
                    stats.failed += 1;
                    stats.total_processing += processing;
                }
                error!(
                    task = %task.id,
                    attempts = task.attempts,
                    error = %e,
                    "❌ Task failed permanently"
                );
                self.dead_letter(&task, &e);
            }
        }

        if self.lock_pool().release(worker_id) {
            info!(worker = worker_id, "👋 Retired worker left the pool");
        }
    }

    fn dead_letter(&self, task: &Task<P>, err: &ResilienceError) {
        let mut ctx = OperationContext::new(TASK_OPERATION_NAME)
            .with_label("priority", task.priority.to_string());
        ctx.operation_id = task.id.to_string();

        let entry = DeadLetterEntry::new(
            &ctx,
            FailureReason::TaskFailed {
                attempts: task.attempts,
            },
            err.to_string(),
            task.attempts,
        );

        if let Err(e) = self.dead_letters.record(entry) {
            warn!(task = %task.id, error = %e, "Failed to record dead-letter entry");
        }
    }

    async fn monitor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        // First sample one interval after start, not at startup
        let period = self.policy.monitor_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.sample_and_scale();
        }
        debug!("Monitor loop stopped");
    }

    fn sample_and_scale(&self) -> ScalingDecision {
        let queue_size = self.lock_queue().len();
        let mut pool = self.lock_pool();
        let counts = pool.counts();
        let sample = LoadSample {
            queue_size,
            busy_workers: counts.busy,
            total_workers: counts.total,
        };

        let mut monitor = self.lock_monitor();
        if !self.policy.auto_scale {
            monitor.record(sample);
            return ScalingDecision::Hold;
        }

        let decision = monitor.observe(sample, self.policy.min_workers, self.policy.max_workers);
        match decision {
            ScalingDecision::ScaleUp if pool.scale_up() => {
                self.lock_stats().scale_ups += 1;
                info!(
                    "📈 Scaled up to {} workers | Queue: {} | Utilization: {:.0}%",
                    pool.size(),
                    queue_size,
                    sample.utilization() * 100.0
                );
            }
            ScalingDecision::ScaleDown if pool.scale_down() => {
                self.lock_stats().scale_downs += 1;
                info!(
                    "📉 Scaled down to {} workers | Queue: {} | Utilization: {:.0}%",
                    pool.size(),
                    queue_size,
                    sample.utilization() * 100.0
                );
            }
            _ => {}
        }
        decision
    }
}
