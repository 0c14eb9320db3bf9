//! Interceptor recording request metrics with OpenTelemetry.
//!
//! Three instruments are registered on the global meter:
//!
//! * `requests_total{procedure, status}` — every dispatch;
//! * `request_duration_seconds{procedure}` — histogram, buckets from 1 ms
//!   to 10 s;
//! * `request_errors_total{procedure, code}` — failed dispatches, labelled
//!   with the taxonomy code.
//!
//! Install an SDK meter provider (`opentelemetry_sdk`) to export them; with
//! no provider installed the instruments are no-ops.

use std::time::Instant;

use async_trait::async_trait;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{KeyValue, global};
use raffel_core::{Context, Envelope, Interceptor, Next, Reply, RpcError};

/// Histogram boundaries in seconds, 1 ms through 10 s.
const DURATION_BOUNDARIES: [f64; 13] = [
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Metrics-recording interceptor.
pub struct Metrics {
    requests: Counter<u64>,
    errors: Counter<u64>,
    duration: Histogram<f64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Register the instruments on the global meter.
    #[must_use]
    pub fn new() -> Self {
        let meter = global::meter("raffel");
        Self {
            requests: meter
                .u64_counter("requests_total")
                .with_description("total dispatched requests")
                .build(),
            errors: meter
                .u64_counter("request_errors_total")
                .with_description("failed requests by taxonomy code")
                .build(),
            duration: meter
                .f64_histogram("request_duration_seconds")
                .with_unit("s")
                .with_description("request duration")
                .with_boundaries(DURATION_BOUNDARIES.to_vec())
                .build(),
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Metrics")
    }
}

#[async_trait]
impl Interceptor for Metrics {
    async fn handle(
        &self,
        envelope: &mut Envelope,
        ctx: &Context,
        next: Next<'_>,
    ) -> Result<Reply, RpcError> {
        let procedure = envelope.procedure.clone();
        let started = Instant::now();
        let result = next.run(envelope, ctx).await;
        let elapsed = started.elapsed().as_secs_f64();

        let status = match &result {
            Ok(_) => "200".to_owned(),
            Err(e) => e.status().to_string(),
        };
        self.requests.add(
            1,
            &[
                KeyValue::new("procedure", procedure.clone()),
                KeyValue::new("status", status),
            ],
        );
        self.duration
            .record(elapsed, &[KeyValue::new("procedure", procedure.clone())]);
        if let Err(e) = &result {
            self.errors.add(
                1,
                &[
                    KeyValue::new("procedure", procedure),
                    KeyValue::new("code", e.kind.as_code()),
                ],
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use raffel_core::{Envelope, EnvelopeKind, HandlerDef, Outcome, Registry, Router};
    use serde_json::Value;

    use super::*;

    #[tokio::test]
    async fn test_metrics_pass_through() {
        let mut registry = Registry::new();
        registry
            .register(HandlerDef::procedure("ok", |_payload, _ctx| async move {
                Ok(Value::Bool(true))
            }))
            .unwrap();
        registry
            .register(HandlerDef::procedure("bad", |_payload, _ctx| async move {
                Err::<Value, _>(RpcError::invalid_argument("nope"))
            }))
            .unwrap();
        let router = Router::new(Arc::new(registry)).use_interceptor(Metrics::new());

        let ok = Envelope::request("1", "ok", Value::Null);
        let Outcome::Unary(response) = router.handle(ok, Context::background()).await else {
            panic!("expected unary outcome");
        };
        assert_eq!(response.kind, EnvelopeKind::Response);

        let bad = Envelope::request("2", "bad", Value::Null);
        let Outcome::Unary(response) = router.handle(bad, Context::background()).await else {
            panic!("expected unary outcome");
        };
        assert_eq!(response.kind, EnvelopeKind::Error);
    }
}
