use thiserror::Error;

/// Core error types for runtime substrate operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{resource} is at capacity ({capacity})")]
    CapacityExceeded {
        resource: &'static str,
        capacity: usize,
    },

    #[error("Scheduler has been stopped")]
    SchedulerStopped,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new CapacityExceeded error
    pub fn capacity_exceeded(resource: &'static str, capacity: usize) -> Self {
        Self::CapacityExceeded { resource, capacity }
    }

    /// Whether the caller may back off and try again.
    ///
    /// A full queue clears as workers drain it; a stopped scheduler or a
    /// malformed payload never will.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
