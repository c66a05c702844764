//! Bounded connection pooling.
//!
//! Backpressure works in two layers:
//!
//! - the pool itself caps checked-out connections at `max_size`;
//! - a [`WaitQueue`] caps the number of callers allowed to wait for one.
//!
//! A caller that finds the wait queue full, or that waits longer than
//! `acquire_timeout`, gets [`Error::PoolExhausted`]. No caller waits
//! indefinitely.
//!
//! Database connections are pooled by `deadpool` and checked out through
//! [`checkout`]. Backends with nothing to pool (the in-memory fake, the HTTP
//! service) bound concurrency with a [`SlotLimiter`] instead. Either way the
//! guard returns its slot on drop, so a cancelled future never leaks one.
//!
//! # Usage
//!
//! ```rust,ignore
//! use knowledge_store::storage::pool::{PoolConfig, SlotLimiter};
//!
//! let slots = SlotLimiter::new(PoolConfig::default(), "in-memory-fake");
//! let _permit = slots.acquire().await?;
//! // released on drop
//! ```

use crate::config::PoolSettings;
use crate::{Error, Result};
use deadpool::managed::{Manager, Object, Pool, PoolError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Acquires a mutex, recovering from poisoning.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Storage mutex was poisoned, recovering");
            metrics::counter!("storage_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Pool sizing and wait limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections opened eagerly when the adapter is built.
    pub min_size: usize,
    /// Maximum checked-out connections.
    pub max_size: usize,
    /// Longest a caller waits for a connection.
    pub acquire_timeout: Duration,
    /// Maximum callers waiting at once.
    pub max_waiters: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_millis(5_000),
            max_waiters: 64,
        }
    }
}

impl PoolConfig {
    /// Sets the maximum size.
    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the acquire timeout.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the waiter bound.
    #[must_use]
    pub const fn with_max_waiters(mut self, max_waiters: usize) -> Self {
        self.max_waiters = max_waiters;
        self
    }

    /// Clamps sizes so `1 <= max_size` and `min_size <= max_size`.
    #[must_use]
    pub fn normalized(self) -> Self {
        let max_size = self.max_size.max(1);
        Self {
            max_size,
            min_size: self.min_size.min(max_size),
            ..self
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            min_size: settings.min_size,
            max_size: settings.max_size.max(1),
            acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
            max_waiters: settings.max_waiters,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Records an acquire timeout and builds the matching error.
pub fn exhausted(backend: &'static str, max_size: usize, waited_ms: u64) -> Error {
    metrics::counter!(
        "storage_pool_exhausted_total",
        "backend" => backend,
        "reason" => "timeout"
    )
    .increment(1);
    tracing::warn!(backend, waited_ms, max_size, "Connection pool acquire timed out");
    Error::PoolExhausted {
        backend,
        max_size,
        waited_ms,
    }
}

/// Bounds the number of callers waiting for a resource.
#[derive(Debug)]
pub struct WaitQueue {
    waiting: AtomicUsize,
    max_waiters: usize,
    backend: &'static str,
}

/// Place in a [`WaitQueue`], released on drop.
#[derive(Debug)]
pub struct WaitTicket<'q> {
    queue: &'q WaitQueue,
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.queue.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WaitQueue {
    /// Creates a queue admitting at most `max_waiters` callers.
    #[must_use]
    pub const fn new(max_waiters: usize, backend: &'static str) -> Self {
        Self {
            waiting: AtomicUsize::new(0),
            max_waiters,
            backend,
        }
    }

    /// Number of callers currently waiting.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Joins the queue, or fails if it is full.
    pub fn enter(&self, max_size: usize) -> Result<WaitTicket<'_>> {
        let previous = self.waiting.fetch_add(1, Ordering::AcqRel);
        if previous >= self.max_waiters {
            self.waiting.fetch_sub(1, Ordering::AcqRel);
            metrics::counter!(
                "storage_pool_exhausted_total",
                "backend" => self.backend,
                "reason" => "queue_full"
            )
            .increment(1);
            return Err(Error::PoolExhausted {
                backend: self.backend,
                max_size,
                waited_ms: 0,
            });
        }
        Ok(WaitTicket { queue: self })
    }
}

/// Checks a connection out of a deadpool `pool`.
///
/// Callers join `waiters` only when no connection is idle. `map_err`
/// receives the pool error and how long the caller waited.
pub async fn checkout<M, F>(
    pool: &Pool<M>,
    waiters: &WaitQueue,
    max_size: usize,
    map_err: F,
) -> Result<Object<M>>
where
    M: Manager,
    F: FnOnce(PoolError<M::Error>, u64) -> Error,
{
    let status = pool.status();
    metrics::gauge!("storage_pool_available", "backend" => waiters.backend)
        .set(status.available as f64);
    let _ticket = if status.available == 0 {
        Some(waiters.enter(max_size)?)
    } else {
        None
    };
    let start = Instant::now();
    let result = pool.get().await;
    let waited_ms = elapsed_ms(start);
    metrics::histogram!("storage_pool_wait_ms", "backend" => waiters.backend)
        .record(waited_ms as f64);
    result.map_err(|e| map_err(e, waited_ms))
}

/// Semaphore slots for backends with no connection to pool.
///
/// Bounds concurrent calls the same way a connection pool would, including
/// the wait queue and acquire timeout.
#[derive(Debug)]
pub struct SlotLimiter {
    semaphore: Arc<Semaphore>,
    waiters: WaitQueue,
    config: PoolConfig,
    backend: &'static str,
}

impl SlotLimiter {
    /// Creates `config.max_size` slots.
    #[must_use]
    pub fn new(config: PoolConfig, backend: &'static str) -> Self {
        let config = config.normalized();
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            waiters: WaitQueue::new(config.max_waiters, backend),
            config,
            backend,
        }
    }

    /// Slots not currently held.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Callers currently waiting.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiters.waiting()
    }

    /// The slot configuration.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Takes a slot, waiting at most `acquire_timeout`.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        metrics::gauge!("storage_pool_available", "backend" => self.backend)
            .set(self.semaphore.available_permits() as f64);

        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(permit);
        }

        let _ticket = self.waiters.enter(self.config.max_size)?;
        let start = Instant::now();
        let acquired = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await;
        let waited_ms = elapsed_ms(start);
        metrics::histogram!("storage_pool_wait_ms", "backend" => self.backend)
            .record(waited_ms as f64);

        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(closed)) => Err(Error::connectivity("acquire", self.backend, closed)),
            Err(_elapsed) => Err(exhausted(self.backend, self.config.max_size, waited_ms)),
        }
    }
}
