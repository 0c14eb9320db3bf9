//! Interceptor enforcing per-request deadlines.
//!
//! The effective deadline is the tighter of the caller's `x-deadline`
//! metadata (already parsed into the context) and the configured duration
//! for the procedure. The handler races a timer; on expiry the context is
//! aborted and the call fails with `DEADLINE_EXCEEDED`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use raffel_extra::timeout::Timeout;
//!
//! let timeout = Timeout::new(Duration::from_secs(30))
//!     .rule("reports.*", Duration::from_secs(120));
//! ```

use std::time::{Duration, Instant};

use async_trait::async_trait;
use raffel_core::hooks::{pattern_matches, pattern_specificity};
use raffel_core::metadata_keys;
use raffel_core::{Context, Envelope, Interceptor, Next, Reply, RpcError, epoch_ms_now};

/// Deadline-enforcing interceptor.
#[derive(Debug)]
pub struct Timeout {
    default: Option<Duration>,
    rules: Vec<(String, Duration)>,
    cascade: Option<Cascade>,
}

#[derive(Copy, Clone, Debug)]
struct Cascade {
    reduction: Duration,
    floor: Duration,
}

impl Timeout {
    /// Apply `default` to every procedure without a more specific rule.
    #[must_use]
    pub fn new(default: Duration) -> Self {
        Self {
            default: Some(default),
            rules: Vec::new(),
            cascade: None,
        }
    }

    /// Only procedures with explicit rules get a timeout.
    #[must_use]
    pub fn rules_only() -> Self {
        Self {
            default: None,
            rules: Vec::new(),
            cascade: None,
        }
    }

    /// Bind a duration to a procedure name or pattern (`reports.*`).
    #[must_use]
    pub fn rule(mut self, pattern: impl Into<String>, duration: Duration) -> Self {
        self.rules.push((pattern.into(), duration));
        self
    }

    /// Shrink the deadline propagated downstream by `reduction` per hop,
    /// clamped to at least `floor` from now. Guards against cascading tail
    /// latency across service hops.
    #[must_use]
    pub fn cascade(mut self, reduction: Duration, floor: Duration) -> Self {
        self.cascade = Some(Cascade { reduction, floor });
        self
    }

    fn configured_for(&self, procedure: &str) -> Option<Duration> {
        self.rules
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, procedure))
            .max_by_key(|(pattern, _)| pattern_specificity(pattern))
            .map(|(_, duration)| *duration)
            .or(self.default)
    }
}

#[async_trait]
impl Interceptor for Timeout {
    async fn handle(
        &self,
        envelope: &mut Envelope,
        ctx: &Context,
        next: Next<'_>,
    ) -> Result<Reply, RpcError> {
        let now = epoch_ms_now();
        let configured = self
            .configured_for(&envelope.procedure)
            .map(|d| now + d.as_millis() as u64);
        let effective = match (ctx.deadline(), configured) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let Some(deadline) = effective else {
            return next.run(envelope, ctx).await;
        };

        if deadline <= now {
            ctx.abort();
            return Err(RpcError::deadline_exceeded_local(0));
        }

        ctx.set_deadline(deadline);
        let downstream = match self.cascade {
            Some(Cascade { reduction, floor }) => deadline
                .saturating_sub(reduction.as_millis() as u64)
                .max(now + floor.as_millis() as u64),
            None => deadline,
        };
        envelope
            .metadata
            .insert(metadata_keys::DEADLINE.to_owned(), downstream.to_string());

        let started = Instant::now();
        let remaining = Duration::from_millis(deadline - now);
        tokio::select! {
            biased;
            result = next.run(envelope, ctx) => result,
            () = tokio::time::sleep(remaining) => {
                ctx.abort();
                let elapsed = started.elapsed().as_millis() as u64;
                tracing::debug!(elapsed_ms = elapsed, "deadline exceeded");
                Err(RpcError::deadline_exceeded_local(elapsed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use raffel_core::{
        Envelope, EnvelopeKind, ErrorKind, HandlerDef, Metadata, Outcome, Registry, Router,
    };
    use serde_json::Value;

    use super::*;

    fn sleepy_router(timeout: Timeout, flag: Arc<AtomicBool>) -> Router {
        let mut registry = Registry::new();
        registry
            .register(HandlerDef::procedure("slow", move |_payload, ctx| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    // Only reached when the deadline did not abort us.
                    flag.store(true, Ordering::SeqCst);
                    assert!(!ctx.is_cancelled());
                    Ok(Value::Null)
                }
            }))
            .unwrap();
        registry
            .register(HandlerDef::procedure("fast", |_payload, _ctx| async move {
                Ok(Value::Null)
            }))
            .unwrap();
        Router::new(Arc::new(registry)).use_interceptor(timeout)
    }

    #[tokio::test]
    async fn test_fast_call_unaffected() {
        let router = sleepy_router(
            Timeout::new(Duration::from_secs(5)),
            Arc::new(AtomicBool::new(false)),
        );
        let envelope = Envelope::request("1", "fast", Value::Null);
        let Outcome::Unary(response) = router.handle(envelope, raffel_core::Context::background()).await
        else {
            panic!("expected unary outcome");
        };
        assert_eq!(response.kind, EnvelopeKind::Response);
    }

    #[tokio::test]
    async fn test_deadline_aborts_slow_handler() {
        let completed = Arc::new(AtomicBool::new(false));
        let router = sleepy_router(Timeout::new(Duration::from_millis(50)), completed.clone());
        let ctx = raffel_core::Context::background();
        let envelope = Envelope::request("1", "slow", Value::Null);
        let Outcome::Unary(response) = router.handle(envelope, ctx.clone()).await else {
            panic!("expected unary outcome");
        };
        let err = response.error().unwrap();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
        // Locally-originated deadline failures report 408.
        assert_eq!(err.status(), 408);
        assert!(ctx.is_cancelled());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_already_expired_caller_deadline() {
        let router = sleepy_router(
            Timeout::new(Duration::from_secs(5)),
            Arc::new(AtomicBool::new(false)),
        );
        let mut metadata = Metadata::new();
        metadata.insert(
            metadata_keys::DEADLINE.to_owned(),
            (epoch_ms_now() - 1000).to_string(),
        );
        let ctx = raffel_core::Context::builder().metadata(metadata).build();
        let envelope = Envelope::request("1", "fast", Value::Null);
        let Outcome::Unary(response) = router.handle(envelope, ctx).await else {
            panic!("expected unary outcome");
        };
        assert_eq!(response.error().unwrap().kind, ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let timeout = Timeout::new(Duration::from_secs(30))
            .rule("reports.*", Duration::from_secs(120))
            .rule("reports.nightly", Duration::from_secs(600));
        assert_eq!(
            timeout.configured_for("reports.nightly"),
            Some(Duration::from_secs(600))
        );
        assert_eq!(
            timeout.configured_for("reports.daily"),
            Some(Duration::from_secs(120))
        );
        assert_eq!(timeout.configured_for("users.create"), Some(Duration::from_secs(30)));
        assert_eq!(Timeout::rules_only().configured_for("users.create"), None);
    }

    #[tokio::test]
    async fn test_cascade_shrinks_downstream_deadline() {
        use std::sync::Mutex;

        // A probe after the timeout observes what `x-deadline` it propagated.
        struct Probe(Arc<Mutex<Option<u64>>>);

        #[async_trait]
        impl Interceptor for Probe {
            async fn handle(
                &self,
                envelope: &mut Envelope,
                ctx: &Context,
                next: Next<'_>,
            ) -> Result<Reply, RpcError> {
                let propagated = envelope
                    .metadata
                    .get(metadata_keys::DEADLINE)
                    .and_then(|v| v.parse::<u64>().ok());
                *self.0.lock().expect("poisoned") = propagated;
                next.run(envelope, ctx).await
            }
        }

        let slot = Arc::new(Mutex::new(None));
        let timeout = Timeout::new(Duration::from_secs(10))
            .cascade(Duration::from_millis(500), Duration::from_millis(100));
        let mut registry = Registry::new();
        registry
            .register(HandlerDef::procedure("hop", |_payload, _ctx| async move {
                Ok(Value::Null)
            }))
            .unwrap();
        let router = Router::new(Arc::new(registry))
            .use_interceptor(timeout)
            .use_interceptor(Probe(slot.clone()));

        let before = epoch_ms_now();
        let envelope = Envelope::request("1", "hop", Value::Null);
        let _ = router.handle(envelope, raffel_core::Context::background()).await;
        let propagated = slot.lock().expect("poisoned").unwrap();
        // Roughly now + 10s - 500ms: shorter than the local deadline but
        // nowhere near the floor.
        assert!(propagated < before + 10_000);
        assert!(propagated > before + 8_000);
    }
}
