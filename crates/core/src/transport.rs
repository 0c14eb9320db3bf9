//! The contract every transport adapter implements.
//!
//! An adapter owns one listener: it parses bytes into envelopes, builds a
//! [`Context`](crate::Context) per request, calls
//! [`Router::handle`](crate::Router::handle), serialises the outcome back,
//! and aborts the context when its transport closes. Lifecycle is
//! idempotent: `start` twice is a no-op, and `stop` drains in-flight work
//! within a grace period before force-closing.
//!
//! [`Lifecycle`] packages the shutdown machinery (stop signal, hard-abort
//! token, task tracking) so each adapter only writes its accept loop.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::RpcError;

/// A transport adapter: one listener bound to one router.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short name for logs (`"http"`, `"tcp"`, ...).
    fn name(&self) -> &'static str;

    /// Bind and start serving. Idempotent.
    async fn start(&self) -> Result<(), RpcError>;

    /// Stop accepting, drain in-flight work for `grace`, then force-close.
    /// Idempotent.
    async fn stop(&self, grace: Duration) -> Result<(), RpcError>;

    /// The bound address, once started. `None` for non-socket transports.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Shared start/stop machinery for adapters.
///
/// Three pieces cooperate during shutdown:
/// 1. the `shutdown` token stops accept loops and signals streams to
///    terminate;
/// 2. the task tracker waits for in-flight connection tasks up to the grace
///    period;
/// 3. the `force` token is the parent of every per-connection token, so
///    cancelling it aborts whatever outlived the grace period.
pub struct Lifecycle {
    started: AtomicBool,
    shutdown: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Fresh, unstarted lifecycle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            force: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Mark started; returns `false` when already started (caller no-ops).
    pub fn begin(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    /// Whether `begin` has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token accept loops and stream pumps watch.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Token for one connection; aborted on force-close.
    ///
    /// Request contexts derive from this, so a force-close cancels every
    /// in-flight request of the connection.
    #[must_use]
    pub fn connection_token(&self) -> CancellationToken {
        self.force.child_token()
    }

    /// Spawn a task whose completion `stop` waits for.
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(fut);
    }

    /// Clone of the task tracker, for spawning from inside accept loops.
    #[must_use]
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Drain for `grace`, then force-close. Idempotent.
    pub async fn stop(&self, grace: Duration) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!("grace period elapsed, force-closing connections");
            self.force.cancel();
            self.tracker.wait().await;
        }
    }
}

impl Debug for Lifecycle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("started", &self.is_started())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// `RpcError` out of a bind/listen failure.
pub fn listen_error(what: &str, e: std::io::Error) -> RpcError {
    RpcError::new(
        crate::ErrorKind::Unavailable,
        format!("failed to bind {what}: {e}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_begin_is_idempotent() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin());
        assert!(!lifecycle.begin());
    }

    #[tokio::test]
    async fn test_stop_waits_for_tracked_tasks() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin();
        let shutdown = lifecycle.shutdown_token();
        lifecycle.spawn(async move {
            shutdown.cancelled().await;
        });
        lifecycle.stop(Duration::from_secs(1)).await;
        assert!(lifecycle.is_shutdown());
    }

    #[tokio::test]
    async fn test_stop_force_closes_after_grace() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin();
        let conn = lifecycle.connection_token();
        lifecycle.spawn(async move {
            // Ignores the shutdown signal; only the force token stops it.
            conn.cancelled().await;
        });
        let started = std::time::Instant::now();
        lifecycle.stop(Duration::from_millis(50)).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin();
        lifecycle.stop(Duration::from_millis(10)).await;
        lifecycle.stop(Duration::from_millis(10)).await;
    }
}
