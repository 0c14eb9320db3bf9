//! Handler abstraction for procedures, streams and events.
//!
//! A handler receives the request payload and the per-request
//! [`Context`] and produces a [`Reply`]: a single value, nothing, or a
//! stream of values. Plain async functions become handlers through the
//! adapter constructors on [`HandlerDef`](crate::registry::HandlerDef);
//! implementing [`RpcHandler`] directly is for cases that carry state:
//!
//! ```
//! use raffel_core::{async_trait, Context, Reply, RpcError, RpcHandler};
//! use serde_json::Value;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl RpcHandler for Echo {
//!     async fn call(&self, payload: Value, _ctx: Context) -> Result<Reply, RpcError> {
//!         Ok(Reply::Value(payload))
//!     }
//! }
//! ```

use std::fmt::{self, Debug, Formatter};
use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::error::RpcError;
use crate::stream::{DEFAULT_HIGH_WATER_MARK, RaffelStream, StreamState};

/// What a handler produced.
pub enum Reply {
    /// One value; the router wraps it in a `response` envelope.
    Value(Value),
    /// Nothing; events acknowledge locally and emit no envelope.
    Empty,
    /// An ordered sequence; the router lifts it to `stream:*` envelopes.
    Stream(RaffelStream<Value>),
}

impl Debug for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Empty => f.write_str("Empty"),
            Self::Stream(s) => f.debug_tuple("Stream").field(&s.id()).finish(),
        }
    }
}

/// The uniform call interface the router dispatches to.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle one request.
    async fn call(&self, payload: Value, ctx: Context) -> Result<Reply, RpcError>;
}

/// Adapter: async fn returning a value.
pub(crate) struct ProcedureFn<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> RpcHandler for ProcedureFn<F>
where
    F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn call(&self, payload: Value, ctx: Context) -> Result<Reply, RpcError> {
        (self.0)(payload, ctx).await.map(Reply::Value)
    }
}

/// Adapter: async fn with no response value.
pub(crate) struct EventFn<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> RpcHandler for EventFn<F>
where
    F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
{
    async fn call(&self, payload: Value, ctx: Context) -> Result<Reply, RpcError> {
        (self.0)(payload, ctx).await.map(|()| Reply::Empty)
    }
}

/// Adapter: async fn returning a ready-made stream.
pub(crate) struct StreamFn<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> RpcHandler for StreamFn<F>
where
    F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RaffelStream<Value>, RpcError>> + Send + 'static,
{
    async fn call(&self, payload: Value, ctx: Context) -> Result<Reply, RpcError> {
        (self.0)(payload, ctx).await.map(Reply::Stream)
    }
}

/// Adapter: async fn that writes into a stream handle.
///
/// The function runs on its own task; the stream is handed back to the
/// router immediately so the consumer applies backpressure through the
/// handle. A function that returns without ending the stream ends it; a
/// function that fails errors it.
pub(crate) struct StreamWriterFn<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> RpcHandler for StreamWriterFn<F>
where
    F: Fn(Value, Context, RaffelStream<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
{
    async fn call(&self, payload: Value, ctx: Context) -> Result<Reply, RpcError> {
        let stream = RaffelStream::new(DEFAULT_HIGH_WATER_MARK);
        let producer = stream.clone();
        let fut = (self.0)(payload, ctx.clone(), producer.clone());
        tokio::spawn(async move {
            tokio::select! {
                result = fut => match result {
                    Ok(()) => {
                        if producer.state() == StreamState::Open {
                            producer.end();
                        }
                    }
                    Err(e) => producer.error(e),
                },
                () = ctx.cancelled() => {
                    producer.cancel(Some("request cancelled"));
                }
            }
        });
        Ok(Reply::Stream(stream))
    }
}
