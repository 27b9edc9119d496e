//! Units of work accepted by the [`TaskScheduler`](super::TaskScheduler).

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Identifier assigned to a task when the scheduler accepts it.
pub type TaskId = u64;

/// Failure of a single task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    /// Create a new Failed error
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// A single callable unit of work.
///
/// The task is owned by its submitter until a worker picks it up, and is
/// consumed by [`Task::execute`]. The token is cancelled when the scheduler
/// is aborted; long-running tasks should observe it.
#[async_trait]
pub trait Task: Send + 'static {
    /// Name used in logs and results.
    fn name(&self) -> &str {
        "task"
    }

    async fn execute(self: Box<Self>, cancel: CancellationToken) -> Result<(), TaskError>;
}

/// Outcome published on the scheduler's result stream.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: TaskId,
    pub name: String,
    pub outcome: Result<(), TaskError>,
}

impl TaskResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Closure adapter produced by [`task_fn`].
pub struct FnTask<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(self: Box<Self>, cancel: CancellationToken) -> Result<(), TaskError> {
        let this = *self;
        (this.f)(cancel).await
    }
}

/// Wrap an async closure as a [`Task`].
///
/// ```ignore
/// scheduler
///     .submit(task_fn("warm-detail", move |_cancel| async move {
///         cache.get_raw("novel:detail:42").await.map(|_| ()).map_err(TaskError::failed)
///     }))
///     .await;
/// ```
pub fn task_fn<F, Fut>(name: impl Into<String>, f: F) -> FnTask<F>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    FnTask {
        name: name.into(),
        f,
    }
}
