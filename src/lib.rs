//! Resilience layer for calls to an unreliable report server
//!
//! Wraps each outbound call in a cache lookup, a memory reservation,
//! connection pool admission and retry with exponential backoff, and
//! exposes health probes and statistics for all of them.

pub mod config;
pub mod core;
pub mod error;
pub mod utils;

// Re-export commonly used types
pub use config::{LogFormat, LoggingConfig, ResilienceConfig};
pub use crate::core::infrastructure::{
    CacheConfig, CacheManager, ExecuteOptions, MemoryRequest, ResilienceManager,
    ResilienceStatistics, RetryConfig, RetryManager, RetryOptions,
};
pub use crate::core::observability::{
    CheckOptions, HealthCheckConfig, HealthCheckManager, HealthProbe, HealthStatus, ProbeReport,
};
pub use crate::core::resources::{
    ConnectionPoolManager, MemoryConfig, MemoryManager, PoolConfig, RequestOptions,
};
pub use error::{AppError, ErrorCategory, Result, TransportErrorKind};
