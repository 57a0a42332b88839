//! Keel Leveler: Queue-Based Load Leveling
//!
//! The leveler sits between bursty producers and a downstream service that
//! can only absorb a steady rate. Producers submit tasks into a bounded
//! priority queue; a dispatch loop hands them to a pool of workers no faster
//! than the rate limiter allows; a monitor loop watches queue depth and
//! worker utilization and resizes the pool.
//!
//! # Architecture
//!
//! ```text
//!   submit_task ──> ┌──────────────┐  QueueFull when at capacity
//!                   │  TaskQueue   │
//!                   │ (priority,   │<──────────────┐
//!                   │  FIFO ties)  │               │ re-queue while
//!                   └──────┬───────┘               │ attempts remain
//!                          │ token from RateLimiter│
//!                          v                       │
//!                   ┌──────────────┐        ┌──────┴──────┐
//!                   │  WorkerPool  │──────> │ TaskHandler │
//!                   │ idle / busy  │        └──────┬──────┘
//!                   └──────^───────┘               │ attempts exhausted
//!                          │ scale up / down       v
//!                   ┌──────┴───────┐        ┌─────────────┐
//!                   │ LoadMonitor  │        │ Dead-Letter │
//!                   │ (rolling avg)│        │    Sink     │
//!                   └──────────────┘        └─────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use keel_core_resilience::ResilienceError;
//! use keel_leveler::{AdmissionQueue, LevelingPolicy, Task, TaskHandler};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Thumbnailer;
//!
//! #[async_trait]
//! impl TaskHandler<String> for Thumbnailer {
//!     async fn handle(&self, task: &Task<String>) -> Result<(), ResilienceError> {
//!         println!("resizing {}", task.payload);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let policy = LevelingPolicy {
//!     max_queue_size: 500,
//!     max_rate: 20,
//!     ..Default::default()
//! };
//!
//! let leveler = AdmissionQueue::new(policy, Arc::new(Thumbnailer))?;
//! leveler.start();
//!
//! leveler.submit_task("cat.png".to_string(), 0)?;
//! leveler.submit_task("urgent.png".to_string(), 10)?;
//!
//! leveler.wait_until_idle(Duration::from_millis(50)).await;
//! leveler.stop().await;
//! println!("{}", leveler.system_status().summary());
//! # Ok(())
//! # }
//! ```

pub mod daemon;
pub mod metrics;
pub mod monitor;
pub mod policy;
pub mod pool;
pub mod queue;
pub mod task;

pub use daemon::AdmissionQueue;
pub use metrics::{LevelerStats, SystemStatus};
pub use monitor::{LoadMonitor, LoadSample, ScalingDecision, ScalingThresholds};
pub use policy::LevelingPolicy;
pub use pool::{PoolCounts, WorkerPool, WorkerState};
pub use queue::TaskQueue;
pub use task::{Task, TaskHandler, TaskId, TaskStatus};
