//! Request-governance middleware for Driftbox Core.

pub mod rate_limit;

pub use rate_limit::{
    client_ip, Admission, DeniedHandler, KeyStrategy, RateLimitConfig, RateLimitLayer,
    RateLimitService, RollbackRecord, SlidingWindowLimiter,
};
