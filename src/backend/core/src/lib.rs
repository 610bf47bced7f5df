//! # Driftbox Core
//!
//! Request governance for the Driftbox backend: admission control and
//! caching in front of the file and log APIs. The relational database,
//! the object store, and authentication are external services; this
//! crate governs how requests reach them.
//!
//! ## Architecture
//!
//! - **Counter Store**: abstraction over the shared Redis instance
//!   (sorted sets with score-range removal, values with expiry)
//! - **Rate Limiting**: sliding-window admission per client identifier,
//!   with quota headers, whitelisting, and admission rollback
//! - **Cache**: read-through caching with glob-pattern invalidation
//! - **Telemetry**: structured JSON/pretty logging
//!
//! Both engines fail open: an unreachable store degrades service to
//! ungoverned/uncached behavior rather than failing requests.

pub mod cache;
pub mod config;
pub mod error;
pub mod middleware;
pub mod store;
pub mod telemetry;

pub use error::{DriftboxError, ErrorCode, ErrorContext, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{Cache, CacheConfig};
    pub use crate::config::Config;
    pub use crate::error::{DriftboxError, ErrorCode, ErrorContext, ErrorSeverity, Result};
    pub use crate::middleware::{
        client_ip, Admission, KeyStrategy, RateLimitConfig, RateLimitLayer, SlidingWindowLimiter,
    };
    pub use crate::store::{CounterStore, MemoryStore, RedisStore, RedisStoreConfig};
    pub use crate::telemetry::{init_logging, LogFormat, LoggingConfig};
}
