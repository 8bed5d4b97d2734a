//! Transfer rate limiting
//!
//! A token bucket owned by the session and handed by reference into
//! every connection's send and receive paths. All mutation happens
//! under one lock, so concurrent consumers can never lose updates.
//! An unlimited bucket is a cheap fast path, not a huge number.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::debug;

struct BucketState {
    tokens: f64,
    /// Bytes per second; `None` means unlimited
    rate: Option<f64>,
    last_refill: Instant,
}

/// Shared token bucket; capacity is one second of the configured rate
pub struct RateLimiter {
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a limiter; `None` or zero means unlimited
    pub fn new(rate: Option<u64>) -> Self {
        let rate = rate.filter(|r| *r > 0).map(|r| r as f64);
        Self {
            state: Mutex::new(BucketState {
                tokens: rate.unwrap_or(0.0),
                rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// An unlimited limiter
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current limit in bytes/s, if any
    pub fn rate(&self) -> Option<u64> {
        self.lock().rate.map(|r| r as u64)
    }

    /// Change the limit; the bucket refills to the new capacity
    pub fn set_rate(&self, rate: Option<u64>) {
        let rate = rate.filter(|r| *r > 0).map(|r| r as f64);
        let mut state = self.lock();
        state.tokens = rate.unwrap_or(0.0);
        state.rate = rate;
        state.last_refill = Instant::now();
        debug!(rate = ?state.rate, "rate limit changed");
    }

    fn refill(state: &mut BucketState, now: Instant) {
        let Some(rate) = state.rate else { return };
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        // Capacity equals one second of rate
        state.tokens = (state.tokens + elapsed * rate).min(rate);
    }

    /// Take `amount` tokens if available right now
    pub fn try_consume(&self, amount: u64) -> bool {
        let mut state = self.lock();
        if state.rate.is_none() {
            return true;
        }
        Self::refill(&mut state, Instant::now());
        if state.tokens >= amount as f64 {
            state.tokens -= amount as f64;
            true
        } else {
            false
        }
    }

    /// Wait until `amount` tokens can be taken
    pub async fn acquire(&self, amount: u64) {
        loop {
            let wait = {
                let mut state = self.lock();
                let Some(rate) = state.rate else { return };
                Self::refill(&mut state, Instant::now());
                if state.tokens >= amount as f64 {
                    state.tokens -= amount as f64;
                    return;
                }
                let missing = amount as f64 - state.tokens;
                Duration::from_secs_f64((missing / rate).max(0.001))
            };
            sleep(wait).await;
        }
    }
}
