//! Connection Pool Management
//!
//! Admission control for outbound requests: at most `max_connections`
//! requests execute at once, up to `max_queue_size` more wait in strict
//! FIFO order, and anything beyond that is rejected immediately.
//!
//! Each admitted request runs on its own task holding a semaphore permit.
//! A caller that gives up (timeout or cancellation) stops waiting, but the
//! permit is only returned once the underlying call settles, so the pool
//! never counts more in-flight calls than it allows.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::utils::duration_ms;

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_queue_size: usize,
    /// Budget for queue wait plus execution of a single request
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_queue_size: 100,
            connection_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Connection pool statistics
///
/// Over the pool's lifetime `created == completed + destroyed` once no
/// work is outstanding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    /// Requests admitted (dispatched or queued)
    pub created: u64,
    /// Dispatched requests whose call has settled
    pub completed: u64,
    /// Queued requests that left without running
    pub destroyed: u64,
    /// Requests refused because the queue was full
    pub rejected: u64,
    pub timed_out: u64,
    pub active: usize,
    pub queued: usize,
    pub max_connections: usize,
    pub max_queue_size: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: u64,
    completed: u64,
    destroyed: u64,
    rejected: u64,
    timed_out: u64,
}

#[derive(Debug)]
struct PoolInner {
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    queued: AtomicUsize,
    counters: Mutex<PoolCounters>,
}

/// A place in the wait queue. Leaving without `admit()` counts as destroyed.
struct QueueTicket {
    inner: Arc<PoolInner>,
    admitted: bool,
}

impl QueueTicket {
    fn reserve(inner: &Arc<PoolInner>) -> Result<Self> {
        let max_queue_size = inner.config.max_queue_size;
        inner
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued < max_queue_size).then_some(queued + 1)
            })
            .map_err(|_| {
                inner.counters.lock().rejected += 1;
                AppError::QueueFull { max_queue_size }
            })?;

        Ok(Self {
            inner: Arc::clone(inner),
            admitted: false,
        })
    }

    fn admit(mut self) {
        self.admitted = true;
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.inner.queued.fetch_sub(1, Ordering::SeqCst);
        if !self.admitted {
            self.inner.counters.lock().destroyed += 1;
        }
    }
}

/// An executing request. The permit is returned after the counters move.
struct ActiveSlot {
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl ActiveSlot {
    fn occupy(inner: &Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        inner.active.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: Arc::clone(inner),
            _permit: permit,
        }
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        self.inner.counters.lock().completed += 1;
    }
}

/// Bounded-concurrency executor with a bounded FIFO wait queue.
#[derive(Debug, Clone)]
pub struct ConnectionPoolManager {
    inner: Arc<PoolInner>,
}

impl ConnectionPoolManager {
    pub fn new(config: PoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            inner: Arc::new(PoolInner {
                config,
                semaphore,
                active: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                counters: Mutex::new(PoolCounters::default()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Run `request_fn` once a slot is free.
    ///
    /// The timeout (per-call or `connection_timeout`) covers queue wait and
    /// execution together.
    pub async fn execute_request<T, F, Fut>(
        &self,
        request_fn: F,
        options: Option<RequestOptions>,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let timeout = options
            .and_then(|o| o.timeout)
            .unwrap_or(self.inner.config.connection_timeout);
        let deadline = deadline_after(timeout);

        let permit = match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.inner.counters.lock().created += 1;
                permit
            }
            Err(TryAcquireError::Closed) => return Err(AppError::PoolClosed),
            Err(TryAcquireError::NoPermits) => self.wait_for_slot(deadline, timeout).await?,
        };

        let slot = ActiveSlot::occupy(&self.inner, permit);
        debug!(
            active = self.inner.active.load(Ordering::SeqCst),
            "Dispatching pooled request"
        );

        let handle = tokio::spawn(async move {
            let _slot = slot;
            request_fn().await
        });

        match timeout_at(deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AppError::InternalServerError(format!(
                "Pooled request did not complete: {}",
                join_error
            ))),
            Err(_) => {
                self.inner.counters.lock().timed_out += 1;
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Pooled request timed out while executing"
                );
                Err(AppError::RequestTimeout { timeout })
            }
        }
    }

    async fn wait_for_slot(
        &self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<OwnedSemaphorePermit> {
        let ticket = QueueTicket::reserve(&self.inner).map_err(|err| {
            warn!(
                max_queue_size = self.inner.config.max_queue_size,
                "Request rejected, wait queue is full"
            );
            err
        })?;
        self.inner.counters.lock().created += 1;
        debug!(
            queued = self.inner.queued.load(Ordering::SeqCst),
            "Request queued, pool at capacity"
        );

        match timeout_at(deadline, Arc::clone(&self.inner.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => {
                ticket.admit();
                Ok(permit)
            }
            Ok(Err(_closed)) => Err(AppError::PoolClosed),
            Err(_) => {
                self.inner.counters.lock().timed_out += 1;
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out waiting in queue"
                );
                Err(AppError::RequestTimeout { timeout })
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn queue_length(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// True when a new request would be rejected outright.
    pub fn is_saturated(&self) -> bool {
        self.queue_length() >= self.inner.config.max_queue_size
            && self.inner.semaphore.available_permits() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }

    pub fn get_statistics(&self) -> PoolStatistics {
        let counters = self.inner.counters.lock();
        PoolStatistics {
            created: counters.created,
            completed: counters.completed,
            destroyed: counters.destroyed,
            rejected: counters.rejected,
            timed_out: counters.timed_out,
            active: self.active_count(),
            queued: self.queue_length(),
            max_connections: self.inner.config.max_connections,
            max_queue_size: self.inner.config.max_queue_size,
        }
    }

    /// Reject everything still queued and refuse new work. Requests already
    /// executing run to completion.
    pub fn destroy(&self) {
        if self.inner.semaphore.is_closed() {
            return;
        }
        self.inner.semaphore.close();
        info!(
            rejected_queued = self.queue_length(),
            still_active = self.active_count(),
            "Connection pool shut down"
        );
    }
}

impl Default for ConnectionPoolManager {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Roughly 30 years; stands in for deadlines that overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}
