//! A simple per-request logging interceptor.
//!
//! Wraps every dispatch in a tracing span carrying the procedure, request
//! id and trace id, and logs the outcome with its duration.
//!
//! # Example
//!
//! ```
//! use raffel_extra::logging::Logger;
//!
//! let logger = Logger::new();
//! ```

use std::time::Instant;

use async_trait::async_trait;
use raffel_core::{Context, Envelope, Interceptor, Next, Reply, RpcError};
use tracing::{Instrument, Level};

/// Span-per-request logging interceptor.
#[derive(Default, Debug)]
pub struct Logger {
    /// Whether failed dispatches log their error details.
    pub log_errors: bool,
}

impl Logger {
    /// Create a new `Logger` interceptor.
    #[must_use]
    pub fn new() -> Self {
        Self { log_errors: true }
    }

    /// Set whether failed dispatches log their error details.
    #[must_use]
    pub fn log_errors(mut self, log_errors: bool) -> Self {
        self.log_errors = log_errors;
        self
    }
}

#[async_trait]
impl Interceptor for Logger {
    async fn handle(
        &self,
        envelope: &mut Envelope,
        ctx: &Context,
        next: Next<'_>,
    ) -> Result<Reply, RpcError> {
        let span = tracing::span!(
            Level::INFO,
            "request",
            procedure = %envelope.procedure,
            request_id = %ctx.request_id(),
            trace_id = %ctx.trace().trace_id,
        );
        async move {
            let now = Instant::now();
            let result = next.run(envelope, ctx).await;
            let duration = now.elapsed();
            match &result {
                Ok(_) => tracing::info!(?duration, "completed"),
                Err(error) if self.log_errors => {
                    tracing::info!(?duration, code = %error.kind, error = %error.message, "failed");
                }
                Err(error) => tracing::info!(?duration, code = %error.kind, "failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}
