//! Per-handler and pattern-matched lifecycle hooks.
//!
//! Hooks are lighter than interceptors: they see the handler's input and
//! output rather than envelopes, and bind to one handler or to a dotted
//! name pattern.
//!
//! * `before(input, ctx)` runs after the interceptor chain reaches the
//!   handler and before the handler body; it may reject.
//! * `after(input, ctx, result)` hooks chain left-to-right, each receiving
//!   the previous hook's result.
//! * `error(input, ctx, err)` hooks may recover with a value or re-map the
//!   error; returning an error passes it to the next hook and, at the end
//!   of the chain, to the router.
//!
//! Patterns are dotted globs: `*` matches everything, `a.*` matches one
//! extra segment (`a.b`), `a.**` matches any deeper name (`a.b`, `a.b.c`).
//! When several patterns match, the most specific runs first (more literal
//! segments wins, `*` beats `**`), ties broken by registration order, and
//! pattern hooks always run before the handler's own hooks.

use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::context::Context;
use crate::error::RpcError;

type BeforeFn = Arc<dyn Fn(Value, Context) -> BoxFuture<'static, Result<(), RpcError>> + Send + Sync>;
type AfterFn =
    Arc<dyn Fn(Value, Context, Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;
type ErrorFn =
    Arc<dyn Fn(Value, Context, RpcError) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// An ordered collection of lifecycle hooks.
#[derive(Clone, Default)]
pub struct Hooks {
    pub(crate) before: Vec<BeforeFn>,
    pub(crate) after: Vec<AfterFn>,
    pub(crate) error: Vec<ErrorFn>,
}

impl Hooks {
    /// An empty hook set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `before` hook.
    #[must_use]
    pub fn before<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        self.before.push(Arc::new(move |input, ctx| Box::pin(f(input, ctx))));
        self
    }

    /// Append an `after` hook.
    #[must_use]
    pub fn after<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value, Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.after
            .push(Arc::new(move |input, ctx, result| Box::pin(f(input, ctx, result))));
        self
    }

    /// Append an `error` hook.
    #[must_use]
    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value, Context, RpcError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.error
            .push(Arc::new(move |input, ctx, err| Box::pin(f(input, ctx, err))));
        self
    }

    /// Whether no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty() && self.error.is_empty()
    }
}

impl Debug for Hooks {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .field("error", &self.error.len())
            .finish()
    }
}

/// A pattern-bound hook set registered on the router.
#[derive(Clone, Debug)]
pub(crate) struct PatternHooks {
    pub(crate) pattern: String,
    pub(crate) hooks: Hooks,
}

/// Whether a dotted glob pattern matches a procedure name.
#[must_use]
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    let mut pattern_segments = pattern.split('.').peekable();
    let mut name_segments = name.split('.');
    loop {
        match pattern_segments.next() {
            None => return name_segments.next().is_none(),
            Some("**") if pattern_segments.peek().is_none() => {
                // Trailing globstar: at least one segment must remain.
                return name_segments.next().is_some();
            }
            Some(segment) => match name_segments.next() {
                Some(part) if segment == "*" || segment == part => {}
                _ => return false,
            },
        }
    }
}

/// Specificity rank: higher sorts earlier.
///
/// More literal segments beat fewer; `*` beats `**` on equal literals.
#[must_use]
pub fn pattern_specificity(pattern: &str) -> (usize, u8) {
    let literals = pattern
        .split('.')
        .filter(|s| *s != "*" && *s != "**")
        .count();
    let wildcard_rank = if pattern.contains("**") {
        0
    } else if pattern.contains('*') {
        1
    } else {
        2
    };
    (literals, wildcard_rank)
}

/// The hook chains effectively bound to one dispatch: matching pattern hooks
/// (most specific first) followed by the handler's own hooks.
pub(crate) struct MergedHooks {
    sets: Vec<Hooks>,
}

impl MergedHooks {
    pub(crate) fn merge(patterns: &[PatternHooks], name: &str, own: &Hooks) -> Self {
        let mut matched: Vec<&PatternHooks> = patterns
            .iter()
            .filter(|p| pattern_matches(&p.pattern, name))
            .collect();
        // Stable sort keeps registration order for equal specificity.
        matched.sort_by_key(|p| std::cmp::Reverse(pattern_specificity(&p.pattern)));
        let mut sets: Vec<Hooks> = matched.into_iter().map(|p| p.hooks.clone()).collect();
        if !own.is_empty() {
            sets.push(own.clone());
        }
        Self { sets }
    }

    pub(crate) async fn run_before(&self, input: &Value, ctx: &Context) -> Result<(), RpcError> {
        for set in &self.sets {
            for hook in &set.before {
                hook(input.clone(), ctx.clone()).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn run_after(
        &self,
        input: &Value,
        ctx: &Context,
        mut result: Value,
    ) -> Result<Value, RpcError> {
        for set in &self.sets {
            for hook in &set.after {
                result = hook(input.clone(), ctx.clone(), result).await?;
            }
        }
        Ok(result)
    }

    /// Run error hooks; the first recovery wins, re-mapped errors flow on.
    pub(crate) async fn run_error(
        &self,
        input: &Value,
        ctx: &Context,
        mut error: RpcError,
    ) -> Result<Value, RpcError> {
        for set in &self.sets {
            for hook in &set.error {
                match hook(input.clone(), ctx.clone(), error.clone()).await {
                    Ok(recovered) => return Ok(recovered),
                    Err(next) => error = next,
                }
            }
        }
        Err(error)
    }
}

impl Debug for MergedHooks {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedHooks").field("sets", &self.sets.len()).finish()
    }
}
