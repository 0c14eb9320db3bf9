//! Dispatch: envelopes in, envelopes (or streams of envelopes) out.
//!
//! The router is the single entry point every adapter uses. It resolves the
//! handler, threads the envelope through the interceptor chain and the
//! handler's hooks, validates input and output, and maps whatever comes
//! back onto response envelopes:
//!
//! * a value → one `response` envelope;
//! * an event handler's return → nothing;
//! * a stream → `stream:start`, one `stream:data` per value, then exactly
//!   one of `stream:end` / `stream:error`.
//!
//! Unary answers echo `<id>:response`; stream envelopes correlate by the
//! request id. Unexpected failures surface as `INTERNAL_ERROR` with the
//! underlying message elided unless [`Router::expose_internal_errors`] is
//! set.

mod pipeline;

use std::fmt::{self, Debug, Formatter};
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use serde_json::Value;

pub use self::pipeline::{Interceptor, Next};
pub(crate) use self::pipeline::Endpoint;

use crate::context::Context;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{ErrorKind, RpcError};
use crate::handler::Reply;
use crate::hooks::{Hooks, MergedHooks, PatternHooks};
use crate::registry::{HandlerKind, Registry};
use crate::stream::RaffelStream;

/// A stream of response envelopes produced by a lifted stream handler.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send + 'static>>;

/// What [`Router::handle`] produced for one inbound envelope.
pub enum Outcome {
    /// Exactly one `response` or `error` envelope.
    Unary(Envelope),
    /// `stream:start (stream:data)* (stream:end | stream:error)`.
    Stream(EnvelopeStream),
    /// Nothing; the envelope was an event.
    None,
}

impl Debug for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary(env) => f.debug_tuple("Unary").field(&env.id).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::None => f.write_str("None"),
        }
    }
}

/// Builds the dispatch pipeline and maps handler output to envelopes.
pub struct Router {
    registry: Arc<Registry>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    pattern_hooks: Vec<PatternHooks>,
    expose_internal: bool,
}

impl Router {
    /// Create a router over a finished registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            interceptors: Vec::new(),
            pattern_hooks: Vec::new(),
            expose_internal: false,
        }
    }

    /// Append a global interceptor. Earlier registrations wrap later ones.
    #[must_use]
    pub fn use_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Bind hooks to a dotted name pattern (`*`, `users.*`, `users.**`).
    #[must_use]
    pub fn hooks(mut self, pattern: impl Into<String>, hooks: Hooks) -> Self {
        self.pattern_hooks.push(PatternHooks {
            pattern: pattern.into(),
            hooks,
        });
        self
    }

    /// Include internal error messages on the wire (debug deployments only).
    #[must_use]
    pub fn expose_internal_errors(mut self, expose: bool) -> Self {
        self.expose_internal = expose;
        self
    }

    /// The registry this router dispatches against.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Dispatch one envelope.
    pub async fn handle(&self, mut envelope: Envelope, ctx: Context) -> Outcome {
        if ctx.is_cancelled() {
            return self.failure(&envelope, &ctx, RpcError::cancelled(None));
        }
        let Some(def) = self.registry.lookup(&envelope.procedure) else {
            return self.failure(&envelope, &ctx, RpcError::not_found(&envelope.procedure));
        };

        let merged = MergedHooks::merge(&self.pattern_hooks, &def.name, &def.hooks);
        let endpoint = Endpoint {
            def: &def,
            hooks: &merged,
        };
        let next = Next {
            rest: &self.interceptors,
            endpoint: &endpoint,
        };

        let result = tokio::select! {
            // Biased so a terminal error that raced the abort wins over the
            // bare CANCELLED mapping.
            biased;
            result = next.run(&mut envelope, &ctx) => result,
            () = ctx.cancelled() => Err(RpcError::cancelled(None)),
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => return self.failure(&envelope, &ctx, err),
        };

        match (def.kind, reply) {
            (HandlerKind::Event, _) => Outcome::None,
            (HandlerKind::Procedure, Reply::Value(value)) => {
                let mut response = envelope.to_response(value);
                response.metadata = ctx.take_response_metadata();
                Outcome::Unary(response)
            }
            (HandlerKind::Procedure, Reply::Empty) => {
                let mut response = envelope.to_response(Value::Null);
                response.metadata = ctx.take_response_metadata();
                Outcome::Unary(response)
            }
            (HandlerKind::Procedure, Reply::Stream(_)) => self.failure(
                &envelope,
                &ctx,
                RpcError::internal("procedure handler returned a stream"),
            ),
            (HandlerKind::Stream, Reply::Stream(stream)) => {
                Outcome::Stream(lift(&envelope, &ctx, stream))
            }
            (HandlerKind::Stream, Reply::Value(value)) => {
                // A stream handler may return a single value; lift it as a
                // one-item sequence.
                let stream = RaffelStream::new(1);
                let producer = stream.clone();
                tokio::spawn(async move {
                    let _ = producer.write(value).await;
                    producer.end();
                });
                Outcome::Stream(lift(&envelope, &ctx, stream))
            }
            (HandlerKind::Stream, Reply::Empty) => {
                let stream = RaffelStream::new(1);
                stream.end();
                Outcome::Stream(lift(&envelope, &ctx, stream))
            }
        }
    }

    /// Map a pipeline failure onto the correct outcome for the envelope.
    fn failure(&self, envelope: &Envelope, ctx: &Context, err: RpcError) -> Outcome {
        let err = self.sanitize(err);
        tracing::debug!(
            procedure = %envelope.procedure,
            code = %err.kind,
            request_id = %ctx.request_id(),
            "dispatch failed: {}",
            err.message,
        );
        if envelope.kind == EnvelopeKind::Event {
            return Outcome::None;
        }
        let mut error_envelope = envelope.to_error(&err);
        error_envelope.metadata = ctx.take_response_metadata();
        Outcome::Unary(error_envelope)
    }

    fn sanitize(&self, err: RpcError) -> RpcError {
        if err.kind == ErrorKind::InternalError && !self.expose_internal {
            RpcError::internal("internal error")
        } else {
            err
        }
    }
}

impl Debug for Router {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("handlers", &self.registry.len())
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

enum Stage {
    Start,
    Data,
    Done,
}

struct Pump {
    base: Envelope,
    ctx: Context,
    stream: RaffelStream<Value>,
    stage: Stage,
}

impl Drop for Pump {
    fn drop(&mut self) {
        // Abandoned mid-stream (adapter stopped consuming): release the
        // producer so its next write fails instead of hanging.
        if !matches!(self.stage, Stage::Done) {
            self.stream.cancel(Some("stream consumer dropped"));
        }
    }
}

/// Lift a value stream into the `start data* (end|error)` envelope sequence.
///
/// The pump pulls from the handler's stream only when the adapter polls, so
/// transport backpressure reaches the handler through the stream's
/// high-water mark. Context cancellation terminates the sequence with a
/// `stream:error` and cancels the source stream, which makes the handler's
/// next write fail.
fn lift(envelope: &Envelope, ctx: &Context, stream: RaffelStream<Value>) -> EnvelopeStream {
    let pump = Pump {
        base: envelope.clone(),
        ctx: ctx.clone(),
        stream,
        stage: Stage::Start,
    };
    Box::pin(futures_util::stream::unfold(pump, |mut pump| async move {
        match pump.stage {
            Stage::Start => {
                pump.stage = Stage::Data;
                let mut start = pump.base.to_stream(EnvelopeKind::StreamStart, Value::Null);
                start.metadata = pump.ctx.take_response_metadata();
                Some((start, pump))
            }
            Stage::Data => {
                let item = tokio::select! {
                    // Biased: once the context aborts, terminate even if the
                    // producer keeps the buffer full.
                    biased;
                    () = pump.ctx.cancelled() => {
                        pump.stream.cancel(Some("transport closed"));
                        Err(RpcError::cancelled(Some("transport closed")))
                    }
                    item = pump.stream.read() => item,
                };
                match item {
                    Ok(Some(value)) => {
                        Some((pump.base.to_stream(EnvelopeKind::StreamData, value), pump))
                    }
                    Ok(None) => {
                        pump.stage = Stage::Done;
                        Some((pump.base.to_stream(EnvelopeKind::StreamEnd, Value::Null), pump))
                    }
                    Err(err) => {
                        pump.stage = Stage::Done;
                        let payload = serde_json::json!({ "error": err.to_wire() });
                        Some((pump.base.to_stream(EnvelopeKind::StreamError, payload), pump))
                    }
                }
            }
            Stage::Done => None,
        }
    }))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures_util::StreamExt;

    use super::*;
    use crate::registry::HandlerDef;
    use crate::validate::RequiredFields;

    fn router_with(defs: Vec<HandlerDef>) -> Router {
        let mut registry = Registry::new();
        for def in defs {
            registry.register(def).unwrap();
        }
        Router::new(Arc::new(registry))
    }

    fn greet() -> HandlerDef {
        HandlerDef::procedure("greet", |payload, _ctx| async move {
            let name = payload["name"].as_str().unwrap_or("world").to_owned();
            Ok(serde_json::json!({ "message": format!("Hello, {name}!") }))
        })
        .input_validator(RequiredFields::new(&["name"]))
    }

    #[tokio::test]
    async fn test_unary_dispatch() {
        let router = router_with(vec![greet()]);
        let envelope = Envelope::request("1", "greet", serde_json::json!({"name": "World"}));
        let Outcome::Unary(response) = router.handle(envelope, Context::background()).await else {
            panic!("expected unary outcome");
        };
        assert_eq!(response.id, "1:response");
        assert_eq!(response.kind, EnvelopeKind::Response);
        assert_eq!(response.payload["message"], "Hello, World!");
    }

    #[tokio::test]
    async fn test_unknown_procedure_is_not_found() {
        let router = router_with(vec![]);
        let envelope = Envelope::request("1", "nope", Value::Null);
        let Outcome::Unary(response) = router.handle(envelope, Context::background()).await else {
            panic!("expected unary outcome");
        };
        assert_eq!(response.kind, EnvelopeKind::Error);
        assert_eq!(response.error().unwrap().kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_validation_failure_never_reaches_handler() {
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_in_handler = called.clone();
        let def = HandlerDef::procedure("strict", move |_payload, _ctx| {
            let called = called_in_handler.clone();
            async move {
                called.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .input_validator(RequiredFields::new(&["name"]));
        let router = router_with(vec![def]);
        let envelope = Envelope::request("1", "strict", serde_json::json!({}));
        let Outcome::Unary(response) = router.handle(envelope, Context::background()).await else {
            panic!("expected unary outcome");
        };
        assert_eq!(response.error().unwrap().kind, ErrorKind::ValidationError);
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_event_yields_no_envelope() {
        let def = HandlerDef::event("audit", |_payload, _ctx| async move { Ok(()) });
        let router = router_with(vec![def]);
        let envelope = Envelope::event("1", "audit", Value::Null);
        assert!(matches!(
            router.handle(envelope, Context::background()).await,
            Outcome::None
        ));
    }

    #[tokio::test]
    async fn test_stream_sequence_matches_yield_order() {
        let def = HandlerDef::stream_writer("count", |payload, _ctx, stream| async move {
            let n = payload["count"].as_u64().unwrap_or(0);
            for i in 1..=n {
                stream.write(serde_json::json!({ "value": i })).await?;
            }
            Ok(())
        });
        let router = router_with(vec![def]);
        let envelope = Envelope::request("7", "count", serde_json::json!({"count": 3}));
        let Outcome::Stream(stream) = router.handle(envelope, Context::background()).await else {
            panic!("expected stream outcome");
        };
        let envelopes: Vec<Envelope> = stream.collect().await;
        let kinds: Vec<EnvelopeKind> = envelopes.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EnvelopeKind::StreamStart,
                EnvelopeKind::StreamData,
                EnvelopeKind::StreamData,
                EnvelopeKind::StreamData,
                EnvelopeKind::StreamEnd,
            ]
        );
        assert_eq!(envelopes[1].payload["value"], 1);
        assert_eq!(envelopes[3].payload["value"], 3);
        // Stream envelopes correlate by the request id.
        assert!(envelopes.iter().all(|e| e.id == "7"));
    }

    #[tokio::test]
    async fn test_stream_handler_error_becomes_stream_error() {
        let def = HandlerDef::stream_writer("flaky", |_payload, _ctx, stream| async move {
            stream.write(serde_json::json!(1)).await?;
            Err(RpcError::new(ErrorKind::Unavailable, "backend lost"))
        });
        let router = router_with(vec![def]).expose_internal_errors(true);
        let envelope = Envelope::request("s", "flaky", Value::Null);
        let Outcome::Stream(stream) = router.handle(envelope, Context::background()).await else {
            panic!("expected stream outcome");
        };
        let envelopes: Vec<Envelope> = stream.collect().await;
        let last = envelopes.last().unwrap();
        assert_eq!(last.kind, EnvelopeKind::StreamError);
        assert_eq!(last.error().unwrap().kind, ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits() {
        let router = router_with(vec![greet()]);
        let ctx = Context::background();
        ctx.abort();
        let envelope = Envelope::request("1", "greet", serde_json::json!({"name": "x"}));
        let Outcome::Unary(response) = router.handle(envelope, ctx).await else {
            panic!("expected unary outcome");
        };
        assert_eq!(response.error().unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_mid_stream_cancellation_aborts_handler() {
        let def = HandlerDef::stream_writer("ticks", |_payload, _ctx, stream| async move {
            let mut i = 0_u64;
            loop {
                i += 1;
                stream.write(serde_json::json!({ "value": i })).await?;
            }
        });
        let router = router_with(vec![def]);
        let ctx = Context::background();
        let envelope = Envelope::request("t", "ticks", Value::Null);
        let Outcome::Stream(mut stream) = router.handle(envelope, ctx.clone()).await else {
            panic!("expected stream outcome");
        };
        assert_eq!(stream.next().await.unwrap().kind, EnvelopeKind::StreamStart);
        assert_eq!(stream.next().await.unwrap().kind, EnvelopeKind::StreamData);
        ctx.abort();
        // Drain until the terminator; buffered data may still arrive first.
        let mut last = None;
        while let Some(envelope) = stream.next().await {
            last = Some(envelope);
        }
        let last = last.unwrap();
        assert_eq!(last.kind, EnvelopeKind::StreamError);
        assert_eq!(last.error().unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_internal_errors_are_elided_by_default() {
        let def = HandlerDef::procedure("secret", |_payload, _ctx| async move {
            Err::<Value, _>(RpcError::internal("password is hunter2"))
        });
        let router = router_with(vec![def]);
        let envelope = Envelope::request("1", "secret", Value::Null);
        let Outcome::Unary(response) = router.handle(envelope, Context::background()).await else {
            panic!("expected unary outcome");
        };
        let err = response.error().unwrap();
        assert_eq!(err.kind, ErrorKind::InternalError);
        assert!(!err.message.contains("hunter2"));
    }

    struct DeadlineGate;

    #[async_trait]
    impl Interceptor for DeadlineGate {
        async fn handle(
            &self,
            envelope: &mut Envelope,
            ctx: &Context,
            next: Next<'_>,
        ) -> Result<Reply, RpcError> {
            envelope.metadata.insert("x-gate".to_owned(), "seen".to_owned());
            ctx.set_response_metadata("x-gate", "seen");
            next.run(envelope, ctx).await
        }
    }

    #[tokio::test]
    async fn test_interceptor_response_metadata_flows_out() {
        let router = router_with(vec![greet()]).use_interceptor(DeadlineGate);
        let envelope = Envelope::request("1", "greet", serde_json::json!({"name": "x"}));
        let Outcome::Unary(response) = router.handle(envelope, Context::background()).await else {
            panic!("expected unary outcome");
        };
        assert_eq!(response.metadata.get("x-gate").map(String::as_str), Some("seen"));
    }

    #[tokio::test]
    async fn test_error_hook_recovers() {
        let def = HandlerDef::procedure("fragile", |_payload, _ctx| async move {
            Err::<Value, _>(RpcError::new(ErrorKind::Unavailable, "backend down"))
        })
        .hooks(Hooks::new().on_error(|_input, _ctx, _err| async move {
            Ok(serde_json::json!({ "fallback": true }))
        }));
        let router = router_with(vec![def]);
        let envelope = Envelope::request("1", "fragile", Value::Null);
        let Outcome::Unary(response) = router.handle(envelope, Context::background()).await else {
            panic!("expected unary outcome");
        };
        assert_eq!(response.kind, EnvelopeKind::Response);
        assert_eq!(response.payload["fallback"], true);
    }
}
