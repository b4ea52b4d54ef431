//! Process-wide LLM call concurrency control.
//!
//! One controller is built at process start and injected into every engine;
//! construction via `Default` exists for tests. Only `acquire` and permit
//! drop mutate state.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{MagiError, MagiResult};

#[derive(Debug, Default)]
struct ControllerMetrics {
    active: AtomicUsize,
    waiting: AtomicUsize,
    total_acquired: AtomicU64,
    total_timeouts: AtomicU64,
    total_rate_limits: AtomicU64,
}

/// Point-in-time metrics view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub active: usize,
    pub waiting: usize,
    pub total_acquired: u64,
    pub total_timeouts: u64,
    pub total_rate_limits: u64,
}

/// Semaphore over all LLM calls in the process.
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    metrics: Arc<ControllerMetrics>,
}

/// RAII permit; dropping it releases the slot.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
    metrics: Arc<ControllerMetrics>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for ConcurrencyController {
    /// Test convenience only; production wiring injects an explicit
    /// controller sized from configuration.
    fn default() -> Self {
        Self::new(5)
    }
}

impl ConcurrencyController {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            metrics: Arc::new(ControllerMetrics::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire one slot, optionally bounded by a deadline.
    pub async fn acquire(&self, timeout: Option<Duration>) -> MagiResult<ConcurrencyPermit> {
        self.metrics.waiting.fetch_add(1, Ordering::Relaxed);
        let acquired = match timeout {
            Some(deadline) => {
                match tokio::time::timeout(
                    deadline,
                    Arc::clone(&self.semaphore).acquire_owned(),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        self.metrics.waiting.fetch_sub(1, Ordering::Relaxed);
                        self.metrics.total_timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(MagiError::ConcurrencyLimit {
                            waited_ms: deadline.as_millis() as u64,
                        });
                    }
                }
            }
            None => Arc::clone(&self.semaphore).acquire_owned().await,
        };
        self.metrics.waiting.fetch_sub(1, Ordering::Relaxed);

        let permit = acquired
            .map_err(|_| MagiError::Internal("concurrency semaphore closed".into()))?;
        self.metrics.active.fetch_add(1, Ordering::Relaxed);
        self.metrics.total_acquired.fetch_add(1, Ordering::Relaxed);

        Ok(ConcurrencyPermit {
            _permit: permit,
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Record a provider rate-limit encounter for observability.
    pub fn note_rate_limit(&self) {
        self.metrics.total_rate_limits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            active: self.metrics.active.load(Ordering::Relaxed),
            waiting: self.metrics.waiting.load(Ordering::Relaxed),
            total_acquired: self.metrics.total_acquired.load(Ordering::Relaxed),
            total_timeouts: self.metrics.total_timeouts.load(Ordering::Relaxed),
            total_rate_limits: self.metrics.total_rate_limits.load(Ordering::Relaxed),
        }
    }
}
