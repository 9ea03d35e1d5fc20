use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::utils::duration_ms;

/// Configuration for the health check registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    #[serde(with = "duration_ms")]
    pub check_interval: Duration,
    /// Used when a registration does not set its own timeout
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,
    pub enable_scheduler: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            default_timeout: Duration::from_secs(5),
            enable_scheduler: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// What a probe returns when it succeeds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeReport {
    pub message: String,
    pub details: HashMap<String, serde_json::Value>,
}

impl ProbeReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// A named health probe. Returning `Err` marks the check unhealthy.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<ProbeReport>;
}

struct FnProbe<F>(F);

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProbeReport>> + Send,
{
    async fn check(&self) -> Result<ProbeReport> {
        (self.0)().await
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub timeout: Option<Duration>,
    pub critical: bool,
    pub description: Option<String>,
}

impl CheckOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Clone)]
pub struct CheckRegistration {
    probe: Arc<dyn HealthProbe>,
    pub timeout: Duration,
    pub critical: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub details: HashMap<String, serde_json::Value>,
    pub critical: bool,
    pub description: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub unhealthy: usize,
    pub critical_failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub summary: HealthSummary,
    pub checks: HashMap<String, HealthCheckResult>,
    pub timestamp: DateTime<Utc>,
}

struct HealthInner {
    config: HealthCheckConfig,
    checks: Mutex<HashMap<String, CheckRegistration>>,
    results: Mutex<HashMap<String, HealthCheckResult>>,
}

impl HealthInner {
    async fn run_single(&self, name: &str, registration: &CheckRegistration) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = timeout(registration.timeout, registration.probe.check()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, message, details) = match outcome {
            Ok(Ok(report)) => (HealthStatus::Healthy, report.message, report.details),
            Ok(Err(err)) => (HealthStatus::Unhealthy, err.to_string(), HashMap::new()),
            Err(_) => {
                let err = AppError::HealthCheckTimeout {
                    name: name.to_string(),
                    timeout: registration.timeout,
                };
                (HealthStatus::Unhealthy, err.to_string(), HashMap::new())
            }
        };

        if status == HealthStatus::Unhealthy {
            warn!(
                check = name,
                critical = registration.critical,
                duration_ms = duration_ms,
                message = %message,
                "Health check failed"
            );
        } else {
            debug!(check = name, duration_ms = duration_ms, "Health check passed");
        }

        let result = HealthCheckResult {
            name: name.to_string(),
            status,
            message,
            details,
            critical: registration.critical,
            description: registration.description.clone(),
            duration_ms,
            timestamp: Utc::now(),
        };

        self.record(name, registration, &result);
        result
    }

    /// Keep the result only while the same registration is still in place.
    fn record(&self, name: &str, registration: &CheckRegistration, result: &HealthCheckResult) {
        let checks = self.checks.lock();
        let current = checks
            .get(name)
            .map_or(false, |live| Arc::ptr_eq(&live.probe, &registration.probe));
        if current {
            self.results.lock().insert(name.to_string(), result.clone());
        } else {
            debug!(check = name, "Discarded result of a replaced or removed health check");
        }
    }

    async fn run_all(&self) -> Vec<HealthCheckResult> {
        let registrations: Vec<(String, CheckRegistration)> = self
            .checks
            .lock()
            .iter()
            .map(|(name, registration)| (name.clone(), registration.clone()))
            .collect();

        join_all(
            registrations
                .iter()
                .map(|(name, registration)| self.run_single(name, registration)),
        )
        .await
    }
}

/// Registry of named probes with a periodic scheduler.
///
/// Every registered probe runs concurrently under its own timeout. The
/// overall verdict is unhealthy iff any recorded result is unhealthy;
/// criticality only affects the summary counts.
pub struct HealthCheckManager {
    inner: Arc<HealthInner>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl HealthCheckManager {
    pub fn new(config: HealthCheckConfig) -> Self {
        let inner = Arc::new(HealthInner {
            config,
            checks: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        });

        let scheduler = if inner.config.enable_scheduler {
            match Handle::try_current() {
                Ok(handle) => Some(handle.spawn(Self::schedule_loop(
                    Arc::downgrade(&inner),
                    inner.config.check_interval,
                ))),
                Err(_) => {
                    debug!("No tokio runtime available, health scheduler disabled");
                    None
                }
            }
        } else {
            None
        };

        Self {
            inner,
            scheduler: Mutex::new(scheduler),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.inner.config
    }

    /// Register a closure probe. A duplicate name replaces the prior registration.
    pub fn register_check<F, Fut>(&self, name: impl Into<String>, check_fn: F, options: CheckOptions)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ProbeReport>> + Send + 'static,
    {
        self.register_probe(name, FnProbe(check_fn), options);
    }

    pub fn register_probe(
        &self,
        name: impl Into<String>,
        probe: impl HealthProbe + 'static,
        options: CheckOptions,
    ) {
        let name = name.into();
        let registration = CheckRegistration {
            probe: Arc::new(probe),
            timeout: options.timeout.unwrap_or(self.inner.config.default_timeout),
            critical: options.critical,
            description: options.description,
        };

        if self.inner.checks.lock().insert(name.clone(), registration).is_some() {
            self.inner.results.lock().remove(&name);
            debug!(check = %name, "Replaced existing health check registration");
        } else {
            info!(check = %name, "Registered health check");
        }
    }

    /// Remove a probe and its last recorded result.
    pub fn unregister_check(&self, name: &str) -> bool {
        let mut checks = self.inner.checks.lock();
        self.inner.results.lock().remove(name);
        checks.remove(name).is_some()
    }

    pub fn get_registration(&self, name: &str) -> Option<CheckRegistration> {
        self.inner.checks.lock().get(name).cloned()
    }

    /// Run one probe against its timeout and record the outcome.
    ///
    /// Independent of the scheduler, so single probes can be driven
    /// deterministically.
    pub async fn run_single_check(
        &self,
        name: &str,
        registration: &CheckRegistration,
    ) -> HealthCheckResult {
        self.inner.run_single(name, registration).await
    }

    pub async fn run_check(&self, name: &str) -> Result<HealthCheckResult> {
        let registration = self
            .get_registration(name)
            .ok_or_else(|| AppError::NotFound(format!("health check '{}'", name)))?;
        Ok(self.inner.run_single(name, &registration).await)
    }

    pub async fn run_all_checks(&self) -> Vec<HealthCheckResult> {
        self.inner.run_all().await
    }

    pub fn get_check_result(&self, name: &str) -> Option<HealthCheckResult> {
        self.inner.results.lock().get(name).cloned()
    }

    pub fn get_health_status(&self) -> HealthReport {
        let checks = self.inner.results.lock().clone();
        let summary = summarize(checks.values());
        let overall = if summary.unhealthy > 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            overall,
            summary,
            checks,
            timestamp: Utc::now(),
        }
    }

    /// Stop the periodic scheduler. Safe to call more than once.
    pub fn destroy(&self) {
        if let Some(handle) = self.scheduler.lock().take() {
            handle.abort();
            info!("Stopped health check scheduler");
        }
    }

    async fn schedule_loop(inner: Weak<HealthInner>, period: Duration) {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            ticker.tick().await;
            let Some(health) = inner.upgrade() else {
                break;
            };
            let results = health.run_all().await;
            debug!(checks = results.len(), "Periodic health checks completed");
        }
    }
}

impl Drop for HealthCheckManager {
    fn drop(&mut self) {
        if let Some(handle) = self.scheduler.get_mut().take() {
            handle.abort();
        }
    }
}

fn summarize<'a>(results: impl Iterator<Item = &'a HealthCheckResult>) -> HealthSummary {
    results.fold(HealthSummary::default(), |mut summary, result| {
        summary.total += 1;
        match result.status {
            HealthStatus::Healthy => summary.healthy += 1,
            HealthStatus::Unhealthy => {
                summary.unhealthy += 1;
                if result.critical {
                    summary.critical_failed += 1;
                }
            }
        }
        summary
    })
}
