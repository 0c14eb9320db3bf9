//! Filesystem driver: one record file per key, TTL-driven cleanup.
//!
//! Records survive process restarts, which is enough persistence for a
//! single-node deployment that must not forget its windows on redeploy.
//! Concurrent access from one process is serialised; cross-process file
//! locking is out of scope.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use raffel_core::{ErrorKind, RpcError, epoch_ms_now};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{RateLimitDriver, WindowState};

#[derive(Serialize, Deserialize, Copy, Clone, Debug)]
struct Record {
    count: u64,
    reset_at: u64,
}

/// One JSON record file per key under a base directory.
#[derive(Debug)]
pub struct FsDriver {
    dir: PathBuf,
    lock: Mutex<()>,
    cleanup: CancellationToken,
}

impl FsDriver {
    /// Store records under `dir` (created on first use).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
            cleanup: CancellationToken::new(),
        }
    }

    /// Spawn a task deleting expired record files every `interval`.
    ///
    /// The task stops at [`shutdown`](RateLimitDriver::shutdown).
    #[must_use]
    pub fn with_cleanup(self, interval: Duration) -> Self {
        let dir = self.dir.clone();
        let token = self.cleanup.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sweep(&dir).await {
                            tracing::debug!("rate-limit cleanup sweep failed: {e}");
                        }
                    }
                }
            }
        });
        self
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let encoded = utf8_percent_encode(key, NON_ALPHANUMERIC).to_string();
        self.dir.join(format!("{encoded}.json"))
    }

    async fn load(&self, key: &str) -> Option<Record> {
        let bytes = tokio::fs::read(self.path_for(key)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn store(&self, key: &str, record: Record) -> Result<(), RpcError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| storage_error("create", e))?;
        let bytes = serde_json::to_vec(&record)?;
        tokio::fs::write(self.path_for(key), bytes)
            .await
            .map_err(|e| storage_error("write", e))
    }
}

/// Delete record files whose window expired.
async fn sweep(dir: &PathBuf) -> std::io::Result<()> {
    let now = epoch_ms_now();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_none_or(|e| e != std::ffi::OsStr::new("json")) {
            continue;
        }
        let expired = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Record>(&bytes)
                .map(|r| r.reset_at < now)
                .unwrap_or(true),
            Err(_) => continue,
        };
        if expired {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
    Ok(())
}

fn storage_error(op: &str, e: std::io::Error) -> RpcError {
    RpcError::new(
        ErrorKind::Unavailable,
        format!("rate-limit store {op} failed: {e}"),
    )
}

#[async_trait]
impl RateLimitDriver for FsDriver {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowState, RpcError> {
        let _guard = self.lock.lock().await;
        let now = epoch_ms_now();
        let record = match self.load(key).await {
            Some(record) if record.reset_at > now => Record {
                count: record.count + 1,
                reset_at: record.reset_at,
            },
            _ => Record {
                count: 1,
                reset_at: now + window.as_millis() as u64,
            },
        };
        self.store(key, record).await?;
        Ok(WindowState {
            count: record.count,
            reset_at: record.reset_at,
        })
    }

    async fn decrement(&self, key: &str) -> Result<(), RpcError> {
        let _guard = self.lock.lock().await;
        if let Some(record) = self.load(key).await {
            self.store(
                key,
                Record {
                    count: record.count.saturating_sub(1),
                    reset_at: record.reset_at,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), RpcError> {
        let _guard = self.lock.lock().await;
        let _ = tokio::fs::remove_file(self.path_for(key)).await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), RpcError> {
        self.cleanup.cancel();
        Ok(())
    }
}
