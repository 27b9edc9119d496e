use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the tiered cache.
///
/// A key that is simply absent is not an error: lookups return `Ok(None)`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("remote cache {op} failed: {message}")]
    TransientRemote { op: &'static str, message: String },

    #[error("remote cache {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("cache payload could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache operation cancelled")]
    Cancelled,

    #[error("batch scheduler is not accepting work")]
    SchedulerUnavailable,
}

impl CacheError {
    pub fn remote(op: &'static str, err: impl Display) -> Self {
        Self::TransientRemote {
            op,
            message: err.to_string(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientRemote { .. } | Self::Timeout { .. })
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
