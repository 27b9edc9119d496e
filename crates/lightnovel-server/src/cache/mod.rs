//! Two-tier caching for content and reader state.
//!
//! ## Architecture
//!
//! - **Local tier (DashMap)**: in-process, microsecond latency, per-instance
//! - **Remote tier (Redis)**: network, millisecond latency, shared across instances
//!
//! ```text
//! GET → local (DashMap) → remote (Redis) → caller loads from source
//!           ↓                  ↓
//!       <1µs latency      ~1-5ms latency
//! ```
//!
//! ## Graceful Degradation
//!
//! If Redis is disabled or unreachable at startup the server runs against
//! [`InMemoryTier`] instead. Once running, remote failures are reported to
//! the caller rather than being folded into misses.

pub mod error;
pub mod invalidation;
pub mod keys;
pub mod local;
pub mod pattern;
pub mod remote;
pub mod tiered;

pub use error::{CacheError, CacheResult};
pub use invalidation::ContentInvalidator;
pub use keys::KeyFamily;
pub use local::{CachedEntry, LocalTier};
pub use pattern::glob_match;
pub use remote::{InMemoryTier, RedisTier, RemoteTier, RemoteValue};
pub use tiered::{CacheStats, TieredCache, TieredCacheOptions};
