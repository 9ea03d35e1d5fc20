//! Resource Management Components
//!
//! - Connection pool admission with a bounded FIFO wait queue
//! - Byte budgeting for in-flight payloads

pub mod connection_pools;
pub mod memory;

pub use connection_pools::{ConnectionPoolManager, PoolConfig, PoolStatistics, RequestOptions};
pub use memory::{AllocationPayload, AllocationRecord, MemoryConfig, MemoryManager, MemoryStatistics};
