//! Token-bucket rate limiting for the producer loop.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::error::{ProducerError, Result};

/// Token bucket pacing how often the producer may emit an artifact.
///
/// Tokens refill continuously at `refill_per_sec`, capped at `capacity`. The
/// bucket is owned and mutated only by the single producer task, so no
/// locking is involved.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    ///
    /// A non-positive or non-finite refill rate is a configuration error: it
    /// would deadlock the producer permanently. Capacity below one token can
    /// never satisfy an acquire and is rejected for the same reason.
    pub fn new(refill_per_sec: f64, capacity: f64) -> Result<Self> {
        if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
            return Err(ProducerError::Configuration(format!(
                "refill rate must be a positive number of tokens per second, got {}",
                refill_per_sec
            )));
        }
        if !capacity.is_finite() || capacity < 1.0 {
            return Err(ProducerError::Configuration(format!(
                "bucket capacity must be at least 1, got {}",
                capacity
            )));
        }
        Ok(Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        })
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available, without blocking.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until one token is available and take it.
    ///
    /// Sleeps exactly the time needed for the deficit to refill rather than
    /// polling. Cancellation is handled by the caller racing this future
    /// against the shutdown channel; a cancelled wait consumes nothing.
    pub async fn acquire(&mut self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let deficit = (1.0 - self.tokens) / self.refill_per_sec;
            trace!("Rate limited, sleeping {:.3}s for next token", deficit);
            tokio::time::sleep(Duration::from_secs_f64(deficit)).await;
        }
    }
}
