//! Aggregates transports behind one start/stop surface.
//!
//! ```no_run
//! # use raffel_core::Server;
//! # async fn run(transport: impl raffel_core::Transport) {
//! let server = Server::new().transport(transport);
//! server.start().await.unwrap();
//! // ...
//! server.stop().await;
//! # }
//! ```

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::error::RpcError;
use crate::transport::Transport;

const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// One handler set exposed over any number of transports.
pub struct Server {
    transports: Vec<Arc<dyn Transport>>,
    grace: Duration,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// An empty server.
    #[must_use]
    pub fn new() -> Self {
        Self {
            transports: Vec::new(),
            grace: DEFAULT_GRACE,
        }
    }

    /// Attach a transport.
    #[must_use]
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transports.push(Arc::new(transport));
        self
    }

    /// Default grace period used by [`stop`](Self::stop).
    #[must_use]
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Start every transport. On failure, already-started transports are
    /// stopped before the error is returned.
    pub async fn start(&self) -> Result<(), RpcError> {
        for (i, transport) in self.transports.iter().enumerate() {
            if let Err(e) = transport.start().await {
                tracing::error!(transport = transport.name(), "failed to start: {e}");
                for started in &self.transports[..i] {
                    started.stop(Duration::ZERO).await.ok();
                }
                return Err(e);
            }
            tracing::info!(
                transport = transport.name(),
                addr = ?transport.local_addr(),
                "transport started",
            );
        }
        Ok(())
    }

    /// Stop with the configured grace period.
    pub async fn stop(&self) {
        self.stop_with_grace(self.grace).await;
    }

    /// Stop, draining in-flight work for at most `grace` per transport.
    pub async fn stop_with_grace(&self, grace: Duration) {
        for transport in &self.transports {
            if let Err(e) = transport.stop(grace).await {
                tracing::warn!(transport = transport.name(), "stop failed: {e}");
            }
        }
    }

    /// The attached transports.
    #[must_use]
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }
}

impl Debug for Server {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("transports", &self.transports.len())
            .finish()
    }
}
