//! Per-channel token-bucket rate limiting
//!
//! One bucket per channel per server, so a busy channel throttles only
//! itself and never starves other channels sharing the same connection.

use crate::config::RateLimitConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Outcome of a token request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenDecision {
    /// A token was consumed; send now
    Granted,
    /// No token available; retry no earlier than the given delay
    Wait(Duration),
}

/// Token bucket for one channel
#[derive(Debug, Clone)]
struct RateBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_refill: Instant,
}

impl RateBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, now: Instant) -> TokenDecision {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            TokenDecision::Granted
        } else {
            let deficit = 1.0 - self.tokens;
            TokenDecision::Wait(Duration::from_secs_f64(deficit / self.refill_rate))
        }
    }

    fn is_full(&self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * self.refill_rate >= self.capacity
    }
}

/// Rate limiter managing buckets keyed by `host:port/channel`
pub struct RateLimiter {
    buckets: Arc<RwLock<HashMap<String, RateBucket>>>,
    capacity: f64,
    refill_rate: f64,
}

impl RateLimiter {
    /// Create a rate limiter from configuration
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            capacity: config.capacity,
            refill_rate: 1.0 / config.refill_interval_secs,
        }
    }

    /// Try to consume one token for the channel. On `Wait`, the caller must
    /// reschedule the send; rate limiting never drops a message.
    pub async fn try_acquire(&self, channel_key: &str) -> TokenDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry(channel_key.to_string())
            .or_insert_with(|| RateBucket::new(self.capacity, self.refill_rate));

        let decision = bucket.try_consume(now);
        if let TokenDecision::Wait(delay) = decision {
            debug!(
                "Rate limit hit for {} - retry in {:.2}s",
                channel_key,
                delay.as_secs_f64()
            );
        }
        decision
    }

    /// Drop buckets that have refilled to capacity; they carry no state
    /// a fresh bucket would not have.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.is_full(now));
        let removed = before - buckets.len();
        if removed > 0 {
            debug!("Swept {} idle rate buckets", removed);
        }
    }

    /// Number of live buckets
    pub async fn bucket_count(&self) -> usize {
        self.buckets.read().await.len()
    }
}
