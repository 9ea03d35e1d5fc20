//! In-flight payload budgeting
//!
//! Tracks a declared byte size per named operation and refuses work that
//! would push a single item past `max_file_size` or the running total past
//! `max_total_memory`. The ledger never frees anything on its own; the
//! background monitor only warns when utilization crosses the threshold.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::utils::duration_ms;

/// Number of allocations named in a threshold warning.
const OLDEST_REPORTED: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_file_size: u64,
    pub max_total_memory: u64,
    /// Fraction of `max_total_memory` above which the monitor warns
    pub cleanup_threshold: f64,
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            max_total_memory: 512 * 1024 * 1024,
            cleanup_threshold: 0.8,
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// Opaque payload kept alongside an allocation; only its declared size counts.
pub type AllocationPayload = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
pub struct AllocationRecord {
    pub operation_id: String,
    pub size: u64,
    pub data: Option<AllocationPayload>,
    pub allocated_at: DateTime<Utc>,
}

impl fmt::Debug for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationRecord")
            .field("operation_id", &self.operation_id)
            .field("size", &self.size)
            .field("has_data", &self.data.is_some())
            .field("allocated_at", &self.allocated_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStatistics {
    pub total_allocated: u64,
    pub active_allocations: usize,
    pub utilization_percent: u64,
    pub peak_allocated: u64,
    pub rejected_allocations: u64,
    pub max_total_memory: u64,
    pub max_file_size: u64,
}

#[derive(Default)]
struct MemoryLedger {
    allocations: HashMap<String, AllocationRecord>,
    total_allocated: u64,
    peak_allocated: u64,
    rejected_allocations: u64,
}

struct MemoryInner {
    config: MemoryConfig,
    ledger: Mutex<MemoryLedger>,
}

impl MemoryInner {
    fn threshold_bytes(&self) -> u64 {
        (self.config.max_total_memory as f64 * self.config.cleanup_threshold) as u64
    }

    fn check_threshold(&self) {
        let ledger = self.ledger.lock();
        if ledger.total_allocated < self.threshold_bytes() {
            return;
        }

        let mut oldest: Vec<&AllocationRecord> = ledger.allocations.values().collect();
        oldest.sort_by_key(|record| record.allocated_at);
        let oldest_ids: Vec<&str> = oldest
            .iter()
            .take(OLDEST_REPORTED)
            .map(|record| record.operation_id.as_str())
            .collect();

        warn!(
            total_allocated = ledger.total_allocated,
            max_total_memory = self.config.max_total_memory,
            active_allocations = ledger.allocations.len(),
            oldest = ?oldest_ids,
            "Memory usage above cleanup threshold"
        );
    }
}

/// Byte-budget ledger for in-flight operations, keyed by operation id.
pub struct MemoryManager {
    inner: Arc<MemoryInner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryManager {
    /// Must be called inside a tokio runtime for the monitor to run.
    pub fn new(config: MemoryConfig) -> Self {
        let monitor_interval = config.cleanup_interval;
        let inner = Arc::new(MemoryInner {
            config,
            ledger: Mutex::new(MemoryLedger::default()),
        });

        let monitor = match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(Self::monitor_loop(
                Arc::downgrade(&inner),
                monitor_interval,
            ))),
            Err(_) => {
                debug!("No tokio runtime available, memory monitor disabled");
                None
            }
        };

        Self {
            inner,
            monitor: Mutex::new(monitor),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    /// Record `size` bytes against `operation_id`.
    ///
    /// Fails without touching the ledger if the item is too large, the
    /// budget would be exceeded, or the id is already in use.
    pub fn allocate(
        &self,
        operation_id: impl Into<String>,
        size: u64,
        data: Option<AllocationPayload>,
    ) -> Result<()> {
        let operation_id = operation_id.into();
        let config = &self.inner.config;
        let mut ledger = self.inner.ledger.lock();

        if size > config.max_file_size {
            ledger.rejected_allocations += 1;
            warn!(
                operation_id = %operation_id,
                size = size,
                max_file_size = config.max_file_size,
                "Allocation rejected, item too large"
            );
            return Err(AppError::FileSizeExceeded {
                actual: size,
                limit: config.max_file_size,
            });
        }

        if ledger.allocations.contains_key(&operation_id) {
            return Err(AppError::DuplicateAllocation { operation_id });
        }

        let allocated = ledger.total_allocated;
        if allocated.saturating_add(size) > config.max_total_memory {
            ledger.rejected_allocations += 1;
            warn!(
                operation_id = %operation_id,
                size = size,
                total_allocated = allocated,
                max_total_memory = config.max_total_memory,
                "Allocation rejected, memory budget exhausted"
            );
            return Err(AppError::MemoryLimitExceeded {
                requested: size,
                allocated,
                limit: config.max_total_memory,
            });
        }

        ledger.total_allocated = allocated + size;
        ledger.peak_allocated = ledger.peak_allocated.max(ledger.total_allocated);
        debug!(
            operation_id = %operation_id,
            size = size,
            total_allocated = ledger.total_allocated,
            "Memory allocated"
        );
        ledger.allocations.insert(
            operation_id.clone(),
            AllocationRecord {
                operation_id,
                size,
                data,
                allocated_at: Utc::now(),
            },
        );

        Ok(())
    }

    /// Release an allocation. Unknown ids are a no-op returning `false`.
    pub fn deallocate(&self, operation_id: &str) -> bool {
        let mut ledger = self.inner.ledger.lock();
        match ledger.allocations.remove(operation_id) {
            Some(record) => {
                ledger.total_allocated -= record.size;
                debug!(
                    operation_id = operation_id,
                    size = record.size,
                    total_allocated = ledger.total_allocated,
                    "Memory deallocated"
                );
                true
            }
            None => false,
        }
    }

    pub fn get_allocation(&self, operation_id: &str) -> Option<AllocationRecord> {
        self.inner.ledger.lock().allocations.get(operation_id).cloned()
    }

    pub fn can_allocate(&self, size: u64) -> bool {
        let config = &self.inner.config;
        size <= config.max_file_size
            && self.inner.ledger.lock().total_allocated.saturating_add(size)
                <= config.max_total_memory
    }

    pub fn is_above_threshold(&self) -> bool {
        self.inner.ledger.lock().total_allocated >= self.inner.threshold_bytes()
    }

    pub fn get_statistics(&self) -> MemoryStatistics {
        let config = &self.inner.config;
        let ledger = self.inner.ledger.lock();

        MemoryStatistics {
            total_allocated: ledger.total_allocated,
            active_allocations: ledger.allocations.len(),
            utilization_percent: utilization_percent(
                ledger.total_allocated,
                config.max_total_memory,
            ),
            peak_allocated: ledger.peak_allocated,
            rejected_allocations: ledger.rejected_allocations,
            max_total_memory: config.max_total_memory,
            max_file_size: config.max_file_size,
        }
    }

    /// Stop the background monitor. Allocations are left untouched.
    pub fn destroy(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
            info!("Stopped memory monitor");
        }
    }

    async fn monitor_loop(inner: Weak<MemoryInner>, period: Duration) {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            ticker.tick().await;
            let Some(memory) = inner.upgrade() else {
                break;
            };
            memory.check_threshold();
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.get_mut().take() {
            handle.abort();
        }
    }
}

/// `round(total / max * 100)`, rounding halves up.
fn utilization_percent(total: u64, max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let (total, max) = (total as u128, max as u128);
    ((total * 100 + max / 2) / max) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn manager(max_file_size: u64, max_total_memory: u64) -> MemoryManager {
        MemoryManager::new(MemoryConfig {
            max_file_size,
            max_total_memory,
            ..MemoryConfig::default()
        })
    }

    #[tokio::test]
    async fn test_allocate_and_deallocate() {
        let memory = manager(500, 1000);

        memory.allocate("export-1", 300, None).unwrap();
        memory.allocate("export-2", 200, None).unwrap();

        let stats = memory.get_statistics();
        assert_eq!(stats.total_allocated, 500);
        assert_eq!(stats.active_allocations, 2);
        assert_eq!(stats.utilization_percent, 50);

        assert!(memory.deallocate("export-1"));
        assert!(!memory.deallocate("export-1"));
        assert_eq!(memory.get_statistics().total_allocated, 200);
        assert_eq!(memory.get_statistics().peak_allocated, 500);
        memory.destroy();
    }

    #[tokio::test]
    async fn test_oversized_item_rejected_without_mutation() {
        let memory = manager(100, 1000);

        let err = memory.allocate("big", 101, None).unwrap_err();
        assert!(matches!(
            err,
            AppError::FileSizeExceeded {
                actual: 101,
                limit: 100
            }
        ));
        assert_eq!(memory.get_statistics().total_allocated, 0);
        assert!(memory.get_allocation("big").is_none());

        memory.allocate("small", 100, None).unwrap();
        assert_eq!(memory.get_statistics().total_allocated, 100);
        memory.destroy();
    }

    #[tokio::test]
    async fn test_budget_exhaustion_rejected_without_mutation() {
        let memory = manager(600, 1000);

        memory.allocate("a", 600, None).unwrap();
        let err = memory.allocate("b", 500, None).unwrap_err();
        assert!(matches!(
            err,
            AppError::MemoryLimitExceeded {
                requested: 500,
                allocated: 600,
                limit: 1000
            }
        ));

        let stats = memory.get_statistics();
        assert_eq!(stats.total_allocated, 600);
        assert_eq!(stats.rejected_allocations, 1);

        memory.allocate("c", 400, None).unwrap();
        assert_eq!(memory.get_statistics().total_allocated, 1000);
        assert!(!memory.can_allocate(1));
        memory.destroy();
    }

    #[tokio::test]
    async fn test_duplicate_operation_id_is_an_error() {
        let memory = manager(500, 1000);

        memory.allocate("job-7", 100, None).unwrap();
        let err = memory.allocate("job-7", 50, None).unwrap_err();
        assert!(matches!(err, AppError::DuplicateAllocation { .. }));

        let record = memory.get_allocation("job-7").unwrap();
        assert_eq!(record.size, 100);
        assert_eq!(memory.get_statistics().total_allocated, 100);
        memory.destroy();
    }

    #[tokio::test]
    async fn test_payload_is_kept_opaque() {
        let memory = manager(500, 1000);
        let payload: AllocationPayload = Arc::new(vec![0u8; 64]);

        memory.allocate("upload", 64, Some(payload)).unwrap();

        let record = memory.get_allocation("upload").unwrap();
        let bytes = record
            .data
            .as_ref()
            .and_then(|data| data.downcast_ref::<Vec<u8>>())
            .unwrap();
        assert_eq!(bytes.len(), 64);
        memory.destroy();
    }

    #[test]
    fn test_utilization_rounding() {
        assert_eq!(utilization_percent(333, 1000), 33);
        assert_eq!(utilization_percent(335, 1000), 34);
        assert_eq!(utilization_percent(1000, 1000), 100);
        assert_eq!(utilization_percent(5, 0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_warns_but_never_evicts() {
        let memory = MemoryManager::new(MemoryConfig {
            max_file_size: 1000,
            max_total_memory: 1000,
            cleanup_threshold: 0.5,
            cleanup_interval: Duration::from_millis(10),
        });

        memory.allocate("report-a", 600, None).unwrap();
        assert!(memory.is_above_threshold());

        sleep(Duration::from_millis(50)).await;

        assert!(memory.get_allocation("report-a").is_some());
        assert_eq!(memory.get_statistics().total_allocated, 600);

        memory.destroy();
        memory.destroy();
    }
}
