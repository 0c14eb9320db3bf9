//! The interceptor chain.
//!
//! Each interceptor receives the envelope, the context and a [`Next`]
//! handle; calling [`Next::run`] passes control inward and returns the
//! result on the way back out, so an interceptor observes both directions
//! of a dispatch.
//!
//! Ordering is strict: for interceptors A then B the trace of one request is
//! `A.pre → B.pre → handler → B.post → A.post`, and symmetric on error.

use std::fmt::{self, Debug, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::context::Context;
use crate::envelope::Envelope;
use crate::error::RpcError;
use crate::handler::Reply;
use crate::hooks::MergedHooks;
use crate::registry::HandlerDef;

/// Middleware around the handler pipeline.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Process the envelope; call `next.run(envelope, ctx)` to continue the
    /// chain, or return early to short-circuit.
    async fn handle(
        &self,
        envelope: &mut Envelope,
        ctx: &Context,
        next: Next<'_>,
    ) -> Result<Reply, RpcError>;
}

/// Handle to the remainder of the pipeline.
pub struct Next<'a> {
    pub(crate) rest: &'a [Arc<dyn Interceptor>],
    pub(crate) endpoint: &'a Endpoint<'a>,
}

impl<'a> Next<'a> {
    /// Run the rest of the chain and the handler.
    pub async fn run(self, envelope: &mut Envelope, ctx: &Context) -> Result<Reply, RpcError> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    rest,
                    endpoint: self.endpoint,
                };
                head.handle(envelope, ctx, next).await
            }
            None => self.endpoint.invoke(envelope, ctx).await,
        }
    }
}

impl Debug for Next<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("remaining", &self.rest.len()).finish()
    }
}

/// The innermost pipeline stage: validation, hooks and the handler itself.
pub(crate) struct Endpoint<'r> {
    pub(crate) def: &'r HandlerDef,
    pub(crate) hooks: &'r MergedHooks,
}

impl Endpoint<'_> {
    pub(crate) async fn invoke(&self, envelope: &mut Envelope, ctx: &Context) -> Result<Reply, RpcError> {
        if let Some(validator) = &self.def.input_validator {
            validator.validate(&envelope.payload)?;
        }
        self.hooks.run_before(&envelope.payload, ctx).await?;

        let call = self.def.handler.call(envelope.payload.clone(), ctx.clone());
        let result = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(procedure = %self.def.name, ?panic, "handler panicked");
                Err(RpcError::internal("handler panicked"))
            }
        };

        match result {
            Ok(Reply::Value(value)) => {
                let value = self.hooks.run_after(&envelope.payload, ctx, value).await?;
                if let Some(validator) = &self.def.output_validator {
                    validator.validate(&value).map_err(|e| {
                        RpcError::internal(format!("output validation failed: {}", e.message))
                    })?;
                }
                Ok(Reply::Value(value))
            }
            Ok(reply) => Ok(reply),
            Err(err) => self
                .hooks
                .run_error(&envelope.payload, ctx, err)
                .await
                .map(Reply::Value),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::hooks::Hooks;
    use crate::registry::HandlerDef;

    struct Tag {
        label: &'static str,
        seen: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Tag {
        async fn handle(
            &self,
            envelope: &mut Envelope,
            ctx: &Context,
            next: Next<'_>,
        ) -> Result<Reply, RpcError> {
            self.seen.lock().push(format!("{}.pre", self.label));
            let result = next.run(envelope, ctx).await;
            self.seen.lock().push(format!("{}.post", self.label));
            result
        }
    }

    #[tokio::test]
    async fn test_chain_order_and_unwind() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let def = HandlerDef::procedure("t", {
            let seen = seen.clone();
            move |_payload, _ctx| {
                let seen = seen.clone();
                async move {
                    seen.lock().push("handler".to_owned());
                    Ok(Value::Null)
                }
            }
        });
        let hooks = MergedHooks::merge(&[], "t", &Hooks::new());
        let endpoint = Endpoint { def: &def, hooks: &hooks };
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Tag { label: "a", seen: seen.clone() }),
            Arc::new(Tag { label: "b", seen: seen.clone() }),
        ];
        let next = Next { rest: &interceptors, endpoint: &endpoint };
        let mut envelope = Envelope::request("1", "t", Value::Null);
        next.run(&mut envelope, &Context::background()).await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec!["a.pre", "b.pre", "handler", "b.post", "a.post"]
        );
    }

    fn explode() -> Value {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let def = HandlerDef::procedure("boom", |_payload, _ctx| async move { Ok(explode()) });
        let hooks = MergedHooks::merge(&[], "boom", &Hooks::new());
        let endpoint = Endpoint { def: &def, hooks: &hooks };
        let next = Next { rest: &[], endpoint: &endpoint };
        let mut envelope = Envelope::request("1", "boom", Value::Null);
        let err = next
            .run(&mut envelope, &Context::background())
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::InternalError);
    }
}
