//! Token-bucket driver: burst-friendly `{tokens, last_refill}` records.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use raffel_core::{RpcError, epoch_ms_now};
use std::collections::HashMap;

use super::{RateLimitDriver, WindowState};

#[derive(Copy, Clone, Debug)]
struct Bucket {
    tokens: f64,
    last_refill: u64,
}

/// Token buckets held in process memory.
///
/// The bucket holds `capacity` tokens and refills linearly over the window
/// passed to `increment`, so `capacity` should match the interceptor's
/// request limit. A full bucket allows a burst of `capacity` calls; after
/// that, calls are admitted at the refill rate.
#[derive(Debug)]
pub struct TokenBucketDriver {
    capacity: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucketDriver {
    /// Buckets of `capacity` tokens.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity: capacity.max(1) as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimitDriver for TokenBucketDriver {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowState, RpcError> {
        let now = epoch_ms_now();
        let window_ms = window.as_millis().max(1) as f64;
        let refill_per_ms = self.capacity / window_ms;

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_owned()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });
        let elapsed = now.saturating_sub(bucket.last_refill) as f64;
        bucket.tokens = (bucket.tokens + elapsed * refill_per_ms).min(self.capacity);
        bucket.last_refill = now;

        let (count, deficit) = if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            let used = (self.capacity - bucket.tokens).round() as u64;
            (used, 1.0 - bucket.tokens.fract())
        } else {
            // Exhausted: report one past the ceiling so callers reject.
            ((self.capacity as u64) + 1, 1.0 - bucket.tokens)
        };
        // Time until the next whole token is available.
        let reset_at = now + (deficit.max(0.0) / refill_per_ms).ceil() as u64;
        Ok(WindowState { count, reset_at })
    }

    async fn decrement(&self, key: &str) -> Result<(), RpcError> {
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(key) {
            bucket.tokens = (bucket.tokens + 1.0).min(self.capacity);
        }
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), RpcError> {
        self.buckets.lock().remove(key);
        Ok(())
    }
}
