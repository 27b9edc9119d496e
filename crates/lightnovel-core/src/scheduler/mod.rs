//! Bounded worker pool for independently schedulable units of work.
//!
//! ## Lifecycle
//!
//! ```text
//! new(W) ──► start(token) ──► submit / try_submit ... ──► stop()
//!              │                                            │
//!              └── W workers pull from a queue of 2W ◄──────┘ drain, then
//!                  and publish to a result stream of 2W       close results
//! ```
//!
//! - A task runs at most once. It runs exactly once unless the scheduler is
//!   aborted (or its parent token cancelled) while the task is still queued.
//! - A panic inside a task is caught and published as [`TaskError::Panicked`];
//!   the worker keeps running.
//! - There is no ordering between submission and completion, and no retry.

mod pool;
mod task;

pub use pool::{SchedulerStats, TaskScheduler};
pub use task::{FnTask, Task, TaskError, TaskId, TaskResult, task_fn};
