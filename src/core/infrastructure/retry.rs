use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::utils::duration_ms;

/// Fraction of the computed delay that jitter may add or subtract.
const JITTER_FACTOR: f64 = 0.1;

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Upper bound on invocations of the operation, first try included
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Per-call overrides. Unset fields fall back to the manager's config.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    pub operation_id: Option<String>,
    pub max_attempts: Option<u32>,
    pub base_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub backoff_multiplier: Option<f64>,
    pub jitter: Option<bool>,
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    fn resolve(&self, base: &RetryConfig) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            base_delay: self.base_delay.unwrap_or(base.base_delay),
            max_delay: self.max_delay.unwrap_or(base.max_delay),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(base.backoff_multiplier),
            jitter: self.jitter.unwrap_or(base.jitter),
        }
    }
}

/// Monotonic retry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStatistics {
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStatisticsSnapshot {
    pub overall: RetryStatistics,
    pub operations: HashMap<String, RetryStatistics>,
}

#[derive(Debug, Default)]
struct RetryLedger {
    overall: RetryStatistics,
    operations: HashMap<String, RetryStatistics>,
}

impl RetryLedger {
    fn record(&mut self, operation_id: Option<&str>, apply: impl Fn(&mut RetryStatistics)) {
        apply(&mut self.overall);
        if let Some(id) = operation_id {
            apply(self.operations.entry(id.to_string()).or_default());
        }
    }
}

/// Re-invokes failing operations with exponential backoff.
///
/// Only errors whose [`crate::AppError::is_retryable`] is true are retried;
/// the last error is returned unchanged once attempts run out.
#[derive(Debug)]
pub struct RetryManager {
    config: RetryConfig,
    ledger: Mutex<RetryLedger>,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            ledger: Mutex::new(RetryLedger::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        mut operation: F,
        options: Option<&RetryOptions>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let config = match options {
            Some(options) => options.resolve(&self.config),
            None => self.config.clone(),
        };
        let operation_id = options.and_then(|o| o.operation_id.as_deref());
        let max_attempts = config.max_attempts.max(1);
        let mut attempt: u32 = 1;

        loop {
            self.ledger
                .lock()
                .record(operation_id, |s| s.total_attempts += 1);

            debug!(
                operation_id = operation_id.unwrap_or("anonymous"),
                attempt = attempt,
                max_attempts = max_attempts,
                "Executing operation with retry"
            );

            match operation().await {
                Ok(result) => {
                    self.ledger
                        .lock()
                        .record(operation_id, |s| s.total_successes += 1);
                    if attempt > 1 {
                        info!(
                            operation_id = operation_id.unwrap_or("anonymous"),
                            attempt = attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !err.is_retryable() {
                        debug!(
                            operation_id = operation_id.unwrap_or("anonymous"),
                            category = ?err.category(),
                            error = %err,
                            "Error is not retryable"
                        );
                        self.ledger
                            .lock()
                            .record(operation_id, |s| s.total_failures += 1);
                        return Err(err);
                    }

                    if attempt >= max_attempts {
                        error!(
                            operation_id = operation_id.unwrap_or("anonymous"),
                            attempts = attempt,
                            error = %err,
                            "Maximum retry attempts reached"
                        );
                        self.ledger
                            .lock()
                            .record(operation_id, |s| s.total_failures += 1);
                        return Err(err);
                    }

                    let delay = Self::calculate_delay(attempt, &config);
                    warn!(
                        operation_id = operation_id.unwrap_or("anonymous"),
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Operation failed, retrying after delay"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Backoff before retry number `attempt` (1-based):
    /// `min(base_delay * multiplier^(attempt-1), max_delay)`, optionally jittered.
    pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_ms = config.max_delay.as_millis() as f64;
        let mut delay_ms =
            (config.base_delay.as_millis() as f64 * config.backoff_multiplier.powi(exponent))
                .min(max_ms);

        if config.jitter {
            let spread = rand::thread_rng().gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
            delay_ms = (delay_ms * (1.0 + spread)).clamp(0.0, max_ms);
        }

        Duration::from_millis(delay_ms.round() as u64)
    }

    /// Counters for everything, or for one operation id.
    pub fn get_statistics(&self, operation_id: Option<&str>) -> RetryStatistics {
        let ledger = self.ledger.lock();
        match operation_id {
            Some(id) => ledger.operations.get(id).copied().unwrap_or_default(),
            None => ledger.overall,
        }
    }

    pub fn snapshot(&self) -> RetryStatisticsSnapshot {
        let ledger = self.ledger.lock();
        RetryStatisticsSnapshot {
            overall: ledger.overall,
            operations: ledger.operations.clone(),
        }
    }

    pub fn reset_statistics(&self) {
        *self.ledger.lock() = RetryLedger::default();
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, TransportErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn deterministic_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn reset_error() -> AppError {
        AppError::transport(TransportErrorKind::ConnectionReset, "socket hang up")
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        let delays: Vec<u64> = (1..=6)
            .map(|n| RetryManager::calculate_delay(n, &config).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000, 10_000]);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig {
            jitter: true,
            ..RetryConfig::default()
        };

        for _ in 0..200 {
            let delay = RetryManager::calculate_delay(2, &config).as_millis() as u64;
            assert!((1800..=2200).contains(&delay), "delay {} out of range", delay);
        }

        let capped = RetryManager::calculate_delay(20, &config);
        assert!(capped <= config.max_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_uses_every_attempt() {
        let manager = RetryManager::new(deterministic_config(4));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<()> = manager
            .execute_with_retry(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(reset_error()) }
                },
                None,
            )
            .await;

        assert!(matches!(
            result,
            Err(AppError::Transport {
                kind: TransportErrorKind::ConnectionReset,
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let stats = manager.get_statistics(None);
        assert_eq!(stats.total_attempts, 4);
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.total_successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_fault_is_not_retried() {
        let manager = RetryManager::new(deterministic_config(5));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<()> = manager
            .execute_with_retry(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(AppError::http(422, "invalid report unit")) }
                },
                None,
            )
            .await;

        assert_eq!(result.unwrap_err().status_code(), Some(422));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let manager = RetryManager::new(deterministic_config(3));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = manager
            .execute_with_retry(
                move || {
                    let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if current < 3 {
                            Err(AppError::http(503, "warming up"))
                        } else {
                            Ok("report-ready")
                        }
                    }
                },
                None,
            )
            .await;

        assert_eq!(result.unwrap(), "report-ready");
        let stats = manager.get_statistics(None);
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_options_override_and_per_operation_statistics() {
        let manager = RetryManager::new(deterministic_config(5));
        let options = RetryOptions::new()
            .with_operation_id("list_resources")
            .with_max_attempts(2);

        let result: Result<()> = manager
            .execute_with_retry(|| async { Err(reset_error()) }, Some(&options))
            .await;
        assert!(result.is_err());

        let per_op = manager.get_statistics(Some("list_resources"));
        assert_eq!(per_op.total_attempts, 2);
        assert_eq!(per_op.total_failures, 1);
        assert_eq!(manager.get_statistics(Some("unknown")), RetryStatistics::default());

        manager.reset_statistics();
        assert_eq!(manager.get_statistics(None), RetryStatistics::default());
        assert!(manager.snapshot().operations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let manager = RetryManager::new(deterministic_config(3));
        let start = tokio::time::Instant::now();

        let _: Result<()> = manager
            .execute_with_retry(|| async { Err(reset_error()) }, None)
            .await;

        // 10ms after the first failure, 20ms after the second
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
