//! Rate-limiting interceptor for the Raffel runtime.
//!
//! The interceptor counts requests per key inside a window and rejects the
//! overflow with `RATE_LIMITED`. Three pieces are pluggable:
//!
//! * the **key generator** identifies the caller — by default the
//!   authenticated principal, then the `x-api-key` metadata, then the
//!   transport's client hint, then the request id;
//! * the **driver** owns the `{count, reset_at}` records —
//!   [`MemoryDriver`] (windowed counters with LRU eviction),
//!   [`TokenBucketDriver`] (burstable `{tokens, last_refill}` variant) and
//!   [`FsDriver`] (file per key with TTL cleanup) ship here; a remote KV
//!   driver is a [`RateLimitDriver`] impl away;
//! * the **quota** is the window length plus the request ceiling.
//!
//! Rejections carry `{limit, remaining, reset_at, retry_after}` details and
//! the `x-ratelimit-*` / `retry-after` response metadata adapters surface
//! as headers.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use raffel_rate_limiter::{MemoryDriver, RateLimit};
//!
//! let limiter = RateLimit::new(MemoryDriver::new(10_000), 100, Duration::from_secs(60));
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raffel_core::metadata_keys;
use raffel_core::{Context, Envelope, ErrorKind, Interceptor, Next, Reply, RpcError, epoch_ms_now};

#[macro_use]
mod cfg;

cfg_feature! {
    #![feature = "memory-driver"]

    mod memory;
    pub use memory::MemoryDriver;
}

cfg_feature! {
    #![feature = "token-bucket"]

    mod bucket;
    pub use bucket::TokenBucketDriver;
}

cfg_feature! {
    #![feature = "fs-driver"]

    mod fs;
    pub use fs::FsDriver;
}

/// One key's counter state inside the current window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WindowState {
    /// Requests counted so far, including the one being processed.
    pub count: u64,
    /// Epoch milliseconds at which the window resets.
    pub reset_at: u64,
}

/// Storage backend for rate-limit records.
///
/// Implementations must treat the `{count, reset_at}` read-modify-write as
/// atomic per key: two concurrent increments observe counts differing by
/// exactly one.
#[async_trait]
pub trait RateLimitDriver: Send + Sync + 'static {
    /// Count one request against `key`, creating or rolling the window.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowState, RpcError>;

    /// Undo one increment (optional; used by quota-refunding callers).
    async fn decrement(&self, _key: &str) -> Result<(), RpcError> {
        Ok(())
    }

    /// Drop the record for `key`.
    async fn reset(&self, key: &str) -> Result<(), RpcError>;

    /// Release driver resources (cleanup tasks, handles).
    async fn shutdown(&self) -> Result<(), RpcError> {
        Ok(())
    }
}

type KeyFn = Arc<dyn Fn(&Envelope, &Context) -> String + Send + Sync>;

/// Default caller identification: principal, API key, client hint, request id.
#[must_use]
pub fn default_key(envelope: &Envelope, ctx: &Context) -> String {
    if let Some(principal) = ctx.auth().and_then(|a| a.principal) {
        return principal;
    }
    if let Some(key) = envelope.metadata.get(metadata_keys::API_KEY) {
        return key.clone();
    }
    if let Some(ip) = envelope.metadata.get(metadata_keys::CLIENT_IP) {
        return ip.clone();
    }
    ctx.request_id().to_owned()
}

/// The rate-limiting interceptor.
pub struct RateLimit<D> {
    driver: D,
    prefix: String,
    limit: u64,
    window: Duration,
    key_fn: KeyFn,
    add_headers: bool,
}

impl<D: RateLimitDriver> RateLimit<D> {
    /// Allow `limit` requests per `window` per key.
    pub fn new(driver: D, limit: u64, window: Duration) -> Self {
        Self {
            driver,
            prefix: "rl:".to_owned(),
            limit,
            window,
            key_fn: Arc::new(default_key),
            add_headers: true,
        }
    }

    /// Namespace the driver keys (useful when several rules share a driver).
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Replace the key generator.
    #[must_use]
    pub fn key_generator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Envelope, &Context) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(f);
        self
    }

    /// Whether to record `x-ratelimit-*` response metadata (default true).
    #[must_use]
    pub fn add_headers(mut self, add_headers: bool) -> Self {
        self.add_headers = add_headers;
        self
    }

    /// Shut the driver down.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        self.driver.shutdown().await
    }
}

impl<D> std::fmt::Debug for RateLimit<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimit")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish()
    }
}

#[async_trait]
impl<D: RateLimitDriver> Interceptor for RateLimit<D> {
    async fn handle(
        &self,
        envelope: &mut Envelope,
        ctx: &Context,
        next: Next<'_>,
    ) -> Result<Reply, RpcError> {
        let key = format!("{}{}", self.prefix, (self.key_fn)(envelope, ctx));
        let state = self.driver.increment(&key, self.window).await?;
        let remaining = self.limit.saturating_sub(state.count);

        if self.add_headers {
            ctx.set_response_metadata(metadata_keys::RATELIMIT_LIMIT, self.limit.to_string());
            ctx.set_response_metadata(metadata_keys::RATELIMIT_REMAINING, remaining.to_string());
            ctx.set_response_metadata(metadata_keys::RATELIMIT_RESET, state.reset_at.to_string());
        }

        if state.count > self.limit {
            let retry_after_ms = state.reset_at.saturating_sub(epoch_ms_now());
            let retry_after = retry_after_ms.div_ceil(1000);
            ctx.set_response_metadata(metadata_keys::RETRY_AFTER, retry_after.to_string());
            tracing::debug!(key = %key, count = state.count, "rate limit exceeded");
            return Err(RpcError::new(
                ErrorKind::RateLimited,
                "rate limit exceeded",
            )
            .with_details(serde_json::json!({
                "limit": self.limit,
                "remaining": 0,
                "reset_at": state.reset_at,
                "retry_after": retry_after,
            })));
        }
        next.run(envelope, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use raffel_core::{AuthInfo, EnvelopeKind, HandlerDef, Outcome, Registry, Router};
    use serde_json::Value;

    use super::*;

    fn limited_router(limiter: RateLimit<MemoryDriver>) -> Router {
        let mut registry = Registry::new();
        registry
            .register(HandlerDef::procedure("limited", |_payload, _ctx| async move {
                Ok(Value::String("ok".to_owned()))
            }))
            .unwrap();
        Router::new(Arc::new(registry)).use_interceptor(limiter)
    }

    fn principal_ctx(principal: &str) -> Context {
        let ctx = Context::background();
        ctx.set_auth(AuthInfo::principal(principal));
        ctx
    }

    async fn call(router: &Router, ctx: &Context) -> Envelope {
        let envelope = Envelope::request("1", "limited", Value::Null);
        match router.handle(envelope, ctx.clone()).await {
            Outcome::Unary(response) => response,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_third_call_in_window_rejected() {
        let limiter = RateLimit::new(MemoryDriver::new(100), 2, Duration::from_secs(1));
        let router = limited_router(limiter);
        let ctx = principal_ctx("alice");

        for _ in 0..2 {
            let response = call(&router, &ctx).await;
            assert_eq!(response.kind, EnvelopeKind::Response);
        }
        let response = call(&router, &ctx).await;
        assert_eq!(response.kind, EnvelopeKind::Error);
        let err = response.error().unwrap();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        let details = err.details.unwrap();
        assert_eq!(details["limit"], 2);
        assert_eq!(details["remaining"], 0);
        assert!(details["retry_after"].as_u64().unwrap() <= 1);

        // Rejection metadata for the adapters.
        assert_eq!(
            response.metadata.get(metadata_keys::RATELIMIT_REMAINING).map(String::as_str),
            Some("0")
        );
        assert!(response.metadata.contains_key(metadata_keys::RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let limiter = RateLimit::new(MemoryDriver::new(100), 1, Duration::from_secs(1));
        let router = limited_router(limiter);

        let alice = principal_ctx("alice");
        let bob = principal_ctx("bob");
        assert_eq!(call(&router, &alice).await.kind, EnvelopeKind::Response);
        assert_eq!(call(&router, &bob).await.kind, EnvelopeKind::Response);
        assert_eq!(call(&router, &alice).await.kind, EnvelopeKind::Error);
    }

    #[tokio::test]
    async fn test_window_rolls_over() {
        let limiter = RateLimit::new(MemoryDriver::new(100), 1, Duration::from_millis(50));
        let router = limited_router(limiter);
        let ctx = principal_ctx("alice");

        assert_eq!(call(&router, &ctx).await.kind, EnvelopeKind::Response);
        assert_eq!(call(&router, &ctx).await.kind, EnvelopeKind::Error);
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(call(&router, &ctx).await.kind, EnvelopeKind::Response);
    }

    #[tokio::test]
    async fn test_success_exposes_remaining() {
        let limiter = RateLimit::new(MemoryDriver::new(100), 5, Duration::from_secs(1));
        let router = limited_router(limiter);
        let ctx = principal_ctx("carol");
        let response = call(&router, &ctx).await;
        assert_eq!(
            response.metadata.get(metadata_keys::RATELIMIT_LIMIT).map(String::as_str),
            Some("5")
        );
        assert_eq!(
            response.metadata.get(metadata_keys::RATELIMIT_REMAINING).map(String::as_str),
            Some("4")
        );
    }

    #[test]
    fn test_default_key_precedence() {
        let ctx = Context::background();
        let envelope = Envelope::request("1", "x", Value::Null)
            .with_metadata(metadata_keys::API_KEY, "key-1")
            .with_metadata(metadata_keys::CLIENT_IP, "10.0.0.1");
        // API key beats client hint.
        assert_eq!(default_key(&envelope, &ctx), "key-1");
        // Principal beats everything.
        ctx.set_auth(AuthInfo::principal("alice"));
        assert_eq!(default_key(&envelope, &ctx), "alice");
        // Fallback: request id.
        let bare = Envelope::request("1", "x", Value::Null);
        let ctx = Context::background();
        assert_eq!(default_key(&bare, &ctx), ctx.request_id());
    }
}
