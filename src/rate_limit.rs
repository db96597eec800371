//! Request budget shared by concurrent fetches within a run.
//!
//! The budget bounds how many requests are in flight at once and, after the
//! upstream signals rate limiting, holds every caller back until the
//! requested delay has elapsed. Counters are plain atomics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ConnectorError, Result};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

#[derive(Debug)]
pub struct RequestBudget {
    permits: Arc<Semaphore>,
    epoch: Instant,
    in_flight: Arc<AtomicUsize>,
    total: AtomicU64,
    throttled: AtomicU64,
    /// Milliseconds since `epoch` before which no request may start.
    resume_at_ms: AtomicU64,
}

/// Held for the duration of one HTTP round trip.
#[derive(Debug)]
pub struct BudgetGuard {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for BudgetGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BudgetSnapshot {
    pub in_flight: usize,
    pub total_requests: u64,
    pub throttled_responses: u64,
}

impl Default for RequestBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT)
    }
}

impl RequestBudget {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            epoch: Instant::now(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            total: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            resume_at_ms: AtomicU64::new(0),
        }
    }

    /// Wait for any active back-off window, then take an in-flight slot.
    pub async fn acquire(&self) -> Result<BudgetGuard> {
        loop {
            let resume_at = self.resume_at_ms.load(Ordering::SeqCst);
            let now = self.elapsed_ms();
            if resume_at <= now {
                break;
            }
            tokio::time::sleep(Duration::from_millis(resume_at - now)).await;
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ConnectorError::Cancelled)?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(BudgetGuard {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Record a rate-limit response; subsequent `acquire` calls wait `delay`.
    pub fn note_throttled(&self, delay: Duration) {
        self.throttled.fetch_add(1, Ordering::SeqCst);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let until = self.elapsed_ms().saturating_add(delay_ms);
        let previous = self.resume_at_ms.fetch_max(until, Ordering::SeqCst);
        debug!(
            delay_ms,
            extended = until > previous,
            "upstream rate limit observed"
        );
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            total_requests: self.total.load(Ordering::SeqCst),
            throttled_responses: self.throttled.load(Ordering::SeqCst),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
