//! In-memory windowed counters with LRU eviction.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use raffel_core::{RpcError, epoch_ms_now};

use super::{RateLimitDriver, WindowState};

#[derive(Copy, Clone, Debug)]
struct Record {
    count: u64,
    reset_at: u64,
}

/// Windowed counters held in process memory.
///
/// Recency is tracked by map order: every touch moves the key to the back,
/// and when the map grows past `max_keys` the least recently used records
/// are evicted from the front.
#[derive(Debug)]
pub struct MemoryDriver {
    max_keys: usize,
    records: Mutex<IndexMap<String, Record>>,
}

impl MemoryDriver {
    /// Hold at most `max_keys` live records.
    #[must_use]
    pub fn new(max_keys: usize) -> Self {
        Self {
            max_keys: max_keys.max(1),
            records: Mutex::new(IndexMap::new()),
        }
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl RateLimitDriver for MemoryDriver {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowState, RpcError> {
        let now = epoch_ms_now();
        let mut records = self.records.lock();
        let record = match records.shift_remove(key) {
            Some(record) if record.reset_at > now => Record {
                count: record.count + 1,
                reset_at: record.reset_at,
            },
            _ => Record {
                count: 1,
                reset_at: now + window.as_millis() as u64,
            },
        };
        records.insert(key.to_owned(), record);
        while records.len() > self.max_keys {
            records.shift_remove_index(0);
        }
        Ok(WindowState {
            count: record.count,
            reset_at: record.reset_at,
        })
    }

    async fn decrement(&self, key: &str) -> Result<(), RpcError> {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(key) {
            record.count = record.count.saturating_sub(1);
        }
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), RpcError> {
        self.records.lock().shift_remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_within_window() {
        let driver = MemoryDriver::new(10);
        let window = Duration::from_secs(60);
        let first = driver.increment("k", window).await.unwrap();
        let second = driver.increment("k", window).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert_eq!(first.reset_at, second.reset_at);
    }

    #[tokio::test]
    async fn test_window_expiry_restarts_count() {
        let driver = MemoryDriver::new(10);
        let window = Duration::from_millis(30);
        driver.increment("k", window).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = driver.increment("k", window).await.unwrap();
        assert_eq!(after.count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        use std::sync::Arc;
        let driver = Arc::new(MemoryDriver::new(10));
        let window = Duration::from_secs(60);
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let driver = driver.clone();
                tokio::spawn(async move { driver.increment("k", window).await.unwrap().count })
            })
            .collect();
        let mut counts = Vec::new();
        for task in tasks {
            counts.push(task.await.unwrap());
        }
        counts.sort_unstable();
        // Every increment observed a distinct consecutive count.
        assert_eq!(counts, (1..=16).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_lru_eviction_at_max_keys() {
        let driver = MemoryDriver::new(2);
        let window = Duration::from_secs(60);
        driver.increment("a", window).await.unwrap();
        driver.increment("b", window).await.unwrap();
        // Touch `a` so `b` is the eviction candidate.
        driver.increment("a", window).await.unwrap();
        driver.increment("c", window).await.unwrap();
        assert_eq!(driver.len(), 2);
        // `a` survived with its history.
        assert!(driver.increment("a", window).await.unwrap().count > 1);
        // `b` was evicted; its next increment starts over.
        assert_eq!(driver.increment("b", window).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_decrement_and_reset() {
        let driver = MemoryDriver::new(10);
        let window = Duration::from_secs(60);
        driver.increment("k", window).await.unwrap();
        driver.increment("k", window).await.unwrap();
        driver.decrement("k").await.unwrap();
        assert_eq!(driver.increment("k", window).await.unwrap().count, 2);
        driver.reset("k").await.unwrap();
        assert_eq!(driver.increment("k", window).await.unwrap().count, 1);
    }
}
