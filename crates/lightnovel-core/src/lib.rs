//! Concurrent runtime substrate shared by the Lightnovel server.
//!
//! - [`scheduler`]: bounded worker pool with drain-on-shutdown
//! - [`hub`]: registry of live push connections with non-blocking fan-out
//! - [`error`]: error taxonomy shared by both

pub mod error;
pub mod hub;
pub mod scheduler;

pub use error::{CoreError, Result};
pub use hub::{BroadcastHub, Connection, ConnectionId, HeartbeatPolicy, HubStats, Outbound};
pub use scheduler::{
    SchedulerStats, Task, TaskError, TaskId, TaskResult, TaskScheduler, task_fn,
};
