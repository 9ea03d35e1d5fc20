//! Resilience façade
//!
//! Composes the cache, memory budget, connection pool and retry managers
//! around a single outbound call:
//!
//! 1. a cache hit short-circuits everything else;
//! 2. the memory reservation is taken before any network activity;
//! 3. the pool admits `retry(operation)` as one unit of work;
//! 4. only successful results are cached.
//!
//! The façade never reinterprets errors from the managers it wraps.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ResilienceConfig;
use crate::core::infrastructure::caching::{CacheManager, CacheStatistics};
use crate::core::infrastructure::retry::{RetryManager, RetryOptions, RetryStatisticsSnapshot};
use crate::core::logging::new_correlation_id;
use crate::core::observability::health_checks::{
    CheckOptions, HealthCheckManager, HealthReport, ProbeReport,
};
use crate::core::resources::connection_pools::{
    ConnectionPoolManager, PoolStatistics, RequestOptions,
};
use crate::core::resources::memory::{MemoryManager, MemoryStatistics};
use crate::error::{AppError, Result};

/// A byte reservation taken for the duration of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRequest {
    pub operation_id: String,
    pub size: u64,
}

/// Per-call options. Everything is optional and falls back to the
/// construction-time configuration.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub cache_key: Option<String>,
    pub cache_ttl: Option<Duration>,
    pub memory: Option<MemoryRequest>,
    pub pool: RequestOptions,
    pub retry: Option<RetryOptions>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_memory(mut self, operation_id: impl Into<String>, size: u64) -> Self {
        self.memory = Some(MemoryRequest {
            operation_id: operation_id.into(),
            size,
        });
        self
    }

    pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool = RequestOptions::with_timeout(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Statistics of every owned manager, each under its own namespace.
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceStatistics {
    pub retry: RetryStatisticsSnapshot,
    pub cache: CacheStatistics,
    pub connection_pool: PoolStatistics,
    pub memory: MemoryStatistics,
    pub health: HealthReport,
}

/// Releases a memory reservation when the call finishes or is dropped.
struct MemoryReservation {
    memory: Arc<MemoryManager>,
    operation_id: String,
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.memory.deallocate(&self.operation_id);
    }
}

pub struct ResilienceManager<V = serde_json::Value> {
    retry: Arc<RetryManager>,
    cache: Arc<CacheManager<V>>,
    pool: ConnectionPoolManager,
    memory: Arc<MemoryManager>,
    health: Arc<HealthCheckManager>,
    destroyed: AtomicBool,
}

impl<V> ResilienceManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Background sweeps only run when constructed inside a tokio runtime.
    pub fn new(config: ResilienceConfig) -> Self {
        info!(
            max_attempts = config.retry.max_attempts,
            max_connections = config.connection_pool.max_connections,
            max_cache_size = config.cache.max_cache_size,
            max_total_memory = config.memory.max_total_memory,
            "Initializing resilience manager"
        );

        Self {
            retry: Arc::new(RetryManager::new(config.retry)),
            cache: Arc::new(CacheManager::new(config.cache)),
            pool: ConnectionPoolManager::new(config.connection_pool),
            memory: Arc::new(MemoryManager::new(config.memory)),
            health: Arc::new(HealthCheckManager::new(config.health)),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn retry(&self) -> &RetryManager {
        &self.retry
    }

    pub fn cache(&self) -> &CacheManager<V> {
        &self.cache
    }

    pub fn connection_pool(&self) -> &ConnectionPoolManager {
        &self.pool
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn health(&self) -> &HealthCheckManager {
        &self.health
    }

    /// Run `operation` behind the cache, memory budget, pool and retry layers.
    pub async fn execute_with_resilience<F, Fut>(
        &self,
        operation: F,
        options: ExecuteOptions,
    ) -> Result<V>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let correlation_id = new_correlation_id();
        let span = info_span!(
            "resilient_call",
            correlation_id = %correlation_id,
            cache_key = options.cache_key.as_deref().unwrap_or("-"),
        );

        self.execute_inner(operation, options).instrument(span).await
    }

    async fn execute_inner<F, Fut>(&self, operation: F, options: ExecuteOptions) -> Result<V>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(key) = options.cache_key.as_deref() {
            if let Some(hit) = self.cache.get(key) {
                debug!("Serving result from cache");
                return Ok(hit);
            }
        }

        let reservation = match options.memory {
            Some(request) => {
                self.memory
                    .allocate(request.operation_id.clone(), request.size, None)?;
                Some(MemoryReservation {
                    memory: Arc::clone(&self.memory),
                    operation_id: request.operation_id,
                })
            }
            None => None,
        };

        let retry = Arc::clone(&self.retry);
        let retry_options = options.retry;
        let result = self
            .pool
            .execute_request(
                move || async move {
                    retry
                        .execute_with_retry(operation, retry_options.as_ref())
                        .await
                },
                Some(options.pool),
            )
            .await;

        drop(reservation);

        match result {
            Ok(value) => {
                if let Some(key) = options.cache_key {
                    self.cache.set(key, value.clone(), options.cache_ttl);
                }
                Ok(value)
            }
            Err(err) => {
                warn!(
                    error = %err,
                    category = ?err.category(),
                    "Resilient call failed"
                );
                Err(err)
            }
        }
    }

    /// Register probes for the memory budget and the connection pool.
    pub fn register_default_checks(&self) {
        let memory = Arc::clone(&self.memory);
        self.health.register_check(
            "memory_budget",
            move || {
                let memory = Arc::clone(&memory);
                async move {
                    let stats = memory.get_statistics();
                    if memory.is_above_threshold() {
                        return Err(AppError::HealthCheckFailed(format!(
                            "memory utilization at {}%",
                            stats.utilization_percent
                        )));
                    }
                    Ok(ProbeReport::new(format!(
                        "memory utilization at {}%",
                        stats.utilization_percent
                    ))
                    .with_detail("total_allocated", stats.total_allocated)
                    .with_detail("active_allocations", stats.active_allocations))
                }
            },
            CheckOptions::new().with_description("In-flight payload memory budget"),
        );

        let pool = self.pool.clone();
        self.health.register_check(
            "connection_pool",
            move || {
                let pool = pool.clone();
                async move {
                    if pool.is_closed() {
                        return Err(AppError::PoolClosed);
                    }
                    let stats = pool.get_statistics();
                    if pool.is_saturated() {
                        return Err(AppError::HealthCheckFailed(format!(
                            "pool saturated: {} active, {} queued",
                            stats.active, stats.queued
                        )));
                    }
                    Ok(ProbeReport::new(format!(
                        "{} of {} connections active",
                        stats.active, stats.max_connections
                    ))
                    .with_detail("queued", stats.queued))
                }
            },
            CheckOptions::new()
                .critical()
                .with_description("Outbound connection pool admission"),
        );
    }

    pub fn get_statistics(&self) -> ResilienceStatistics {
        ResilienceStatistics {
            retry: self.retry.snapshot(),
            cache: self.cache.get_statistics(),
            connection_pool: self.pool.get_statistics(),
            memory: self.memory.get_statistics(),
            health: self.health.get_health_status(),
        }
    }

    /// Tear down every owned manager. Only the first call has an effect.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.health.destroy();
        self.pool.destroy();
        self.cache.destroy();
        self.memory.destroy();
        self.retry.reset_statistics();
        info!("Resilience manager destroyed");
    }
}

impl<V> Default for ResilienceManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        config.retry.base_delay = Duration::from_millis(10);
        config.retry.max_delay = Duration::from_millis(100);
        config.retry.jitter = false;
        config.health.enable_scheduler = false;
        config.memory.max_file_size = 1024;
        config.memory.max_total_memory = 4096;
        config
    }

    fn counted(
        calls: &Arc<AtomicUsize>,
        result: serde_json::Value,
    ) -> impl FnMut() -> futures::future::Ready<Result<serde_json::Value>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(result.clone()))
        }
    }

    #[tokio::test]
    async fn test_cache_short_circuit() {
        let manager: ResilienceManager = ResilienceManager::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let options = ExecuteOptions::new().with_cache_key("report:42");
        let first = manager
            .execute_with_resilience(counted(&calls, json!({"rows": 3})), options.clone())
            .await
            .unwrap();
        let second = manager
            .execute_with_resilience(counted(&calls, json!({"rows": 99})), options)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(manager.connection_pool().get_statistics().created, 1);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_memory_rejection_happens_before_dispatch() {
        let manager: ResilienceManager = ResilienceManager::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let err = manager
            .execute_with_resilience(
                counted(&calls, json!(null)),
                ExecuteOptions::new().with_memory("upload-1", 2048),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::FileSizeExceeded { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.connection_pool().get_statistics().created, 0);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_memory_released_on_success_and_failure() {
        let manager: ResilienceManager = ResilienceManager::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        manager
            .execute_with_resilience(
                counted(&calls, json!("ok")),
                ExecuteOptions::new().with_memory("upload-ok", 512),
            )
            .await
            .unwrap();
        assert_eq!(manager.memory().get_statistics().total_allocated, 0);

        let err = manager
            .execute_with_resilience(
                || async { Err::<serde_json::Value, _>(AppError::http(400, "bad report id")) },
                ExecuteOptions::new().with_memory("upload-bad", 512),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(400));
        assert_eq!(manager.memory().get_statistics().total_allocated, 0);
        assert!(manager.memory().get_allocation("upload-bad").is_none());
        manager.destroy();
    }

    #[tokio::test]
    async fn test_failure_is_not_cached_and_client_faults_are_not_retried() {
        let manager: ResilienceManager = ResilienceManager::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let err = manager
            .execute_with_resilience(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<serde_json::Value, _>(AppError::http(422, "invalid filter")) }
                },
                ExecuteOptions::new().with_cache_key("report:bad"),
            )
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), Some(422));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!manager.cache().has("report:bad"));
        manager.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried_inside_one_pool_slot() {
        let manager: ResilienceManager = ResilienceManager::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let value = manager
            .execute_with_resilience(
                move || {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if attempt < 3 {
                            Err(AppError::http(503, "report server busy"))
                        } else {
                            Ok(json!({"attempt": attempt}))
                        }
                    }
                },
                ExecuteOptions::new()
                    .with_retry(RetryOptions::new().with_operation_id("fetch_report")),
            )
            .await
            .unwrap();

        assert_eq!(value, json!({"attempt": 3}));
        let stats = manager.get_statistics();
        assert_eq!(stats.retry.operations["fetch_report"].total_attempts, 3);
        assert_eq!(stats.connection_pool.created, 1);
        assert_eq!(stats.connection_pool.completed, 1);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_default_checks_report_healthy() {
        let manager: ResilienceManager = ResilienceManager::new(fast_config());
        manager.register_default_checks();

        let results = manager.health().run_all_checks().await;
        assert_eq!(results.len(), 2);

        let report = manager.get_statistics().health;
        assert_eq!(report.summary.healthy, 2);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_pool_check_fails_after_destroy() {
        let manager: ResilienceManager = ResilienceManager::new(fast_config());
        manager.register_default_checks();
        manager.destroy();

        let result = manager.health().run_check("connection_pool").await.unwrap();
        assert!(result.critical);
        assert_eq!(
            manager.health().get_health_status().summary.critical_failed,
            1
        );
    }

    #[tokio::test]
    async fn test_statistics_serialize_by_namespace() {
        let manager: ResilienceManager = ResilienceManager::new(fast_config());
        let value = serde_json::to_value(manager.get_statistics()).unwrap();

        for key in ["retry", "cache", "connection_pool", "memory", "health"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        manager.destroy();
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_closes_pool() {
        let manager: ResilienceManager = ResilienceManager::new(fast_config());
        manager.destroy();
        manager.destroy();

        let err = manager
            .execute_with_resilience(
                || async { Ok(json!(1)) },
                ExecuteOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PoolClosed));
    }
}
