//! Core resilience patterns
//!
//! Organized the same way as the managers they hold: infrastructure
//! (retry, cache, façade), resources (pool, memory) and observability
//! (health checks), plus logging setup.

// Retry, caching and the resilience façade
pub mod infrastructure;

// Structured logging setup
pub mod logging;

// Health probing
pub mod observability;

// Connection pool and memory budgeting
pub mod resources;
