//! Core infrastructure services and utilities
//!
//! Retry with backoff, the TTL cache and the resilience façade that
//! composes them with the resource managers.

pub mod caching;
pub mod resilience;
pub mod retry;

// Re-export commonly used types
pub use caching::{CacheConfig, CacheManager, CacheStatistics};
pub use resilience::{ExecuteOptions, MemoryRequest, ResilienceManager, ResilienceStatistics};
pub use retry::{RetryConfig, RetryManager, RetryOptions, RetryStatistics};
