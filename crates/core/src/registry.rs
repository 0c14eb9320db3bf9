//! The indexed store of handler definitions.
//!
//! Registration happens at startup; after the registry is handed to a
//! router (behind an `Arc`) it is read-only, so lookups on the hot path are
//! a single hash probe with no locking.
//!
//! ```
//! use raffel_core::{HandlerDef, Registry};
//! use serde_json::json;
//!
//! let mut registry = Registry::new();
//! registry
//!     .register(HandlerDef::procedure("greet", |payload, _ctx| async move {
//!         let name = payload["name"].as_str().unwrap_or("world");
//!         Ok(json!({ "message": format!("Hello, {name}!") }))
//!     }))
//!     .unwrap();
//! assert!(registry.lookup("greet").is_some());
//! ```

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::context::Context;
use crate::envelope::Metadata;
use crate::error::{ErrorKind, RpcError};
use crate::handler::{EventFn, ProcedureFn, RpcHandler, StreamFn, StreamWriterFn};
use crate::hooks::Hooks;
use crate::stream::RaffelStream;
use crate::validate::Validator;

/// What shape of exchange a handler implements.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum HandlerKind {
    /// Unary request/response.
    Procedure,
    /// One input, ordered sequence of outputs.
    Stream,
    /// Fire-and-forget, no response envelope.
    Event,
}

/// Flow direction of a stream handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub enum StreamDirection {
    /// Server pushes a sequence for one request (the common case).
    #[default]
    Server,
    /// Client pushes a sequence, server answers once.
    Client,
    /// Both sides stream.
    Bidi,
}

/// One registered handler with everything the router needs to dispatch it.
#[derive(Clone)]
pub struct HandlerDef {
    pub(crate) name: String,
    pub(crate) kind: HandlerKind,
    pub(crate) direction: StreamDirection,
    pub(crate) handler: Arc<dyn RpcHandler>,
    pub(crate) input_validator: Option<Arc<dyn Validator>>,
    pub(crate) output_validator: Option<Arc<dyn Validator>>,
    pub(crate) hooks: Hooks,
    pub(crate) metadata: Metadata,
}

impl HandlerDef {
    /// A definition around an explicit [`RpcHandler`].
    pub fn with_handler(
        name: impl Into<String>,
        kind: HandlerKind,
        handler: Arc<dyn RpcHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            direction: StreamDirection::default(),
            handler,
            input_validator: None,
            output_validator: None,
            hooks: Hooks::new(),
            metadata: Metadata::new(),
        }
    }

    /// A unary procedure from an async fn.
    pub fn procedure<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Self::with_handler(name, HandlerKind::Procedure, Arc::new(ProcedureFn(f)))
    }

    /// An event handler from an async fn; its return value is discarded.
    pub fn event<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        Self::with_handler(name, HandlerKind::Event, Arc::new(EventFn(f)))
    }

    /// A stream handler from an async fn returning a stream.
    pub fn stream<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RaffelStream<Value>, RpcError>> + Send + 'static,
    {
        Self::with_handler(name, HandlerKind::Stream, Arc::new(StreamFn(f)))
    }

    /// A stream handler from an async fn that writes into a handle.
    ///
    /// The router recognises both stream styles and lifts them uniformly.
    pub fn stream_writer<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Context, RaffelStream<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        Self::with_handler(name, HandlerKind::Stream, Arc::new(StreamWriterFn(f)))
    }

    /// Set the stream direction (stream handlers only).
    #[must_use]
    pub fn direction(mut self, direction: StreamDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Validate inputs before the handler runs.
    #[must_use]
    pub fn input_validator(mut self, validator: impl Validator) -> Self {
        self.input_validator = Some(Arc::new(validator));
        self
    }

    /// Validate the handler's output value.
    #[must_use]
    pub fn output_validator(mut self, validator: impl Validator) -> Self {
        self.output_validator = Some(Arc::new(validator));
        self
    }

    /// Attach per-handler lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Attach protocol metadata (REST path, content hints, ...).
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Handler name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handler kind.
    #[must_use]
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Protocol metadata.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Debug for HandlerDef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Store of handler definitions, indexed by name.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<HandlerDef>>,
}

impl Registry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition.
    ///
    /// Name collisions fail with `ALREADY_EXISTS` regardless of kind.
    pub fn register(&mut self, def: HandlerDef) -> Result<(), RpcError> {
        if self.handlers.contains_key(&def.name) {
            return Err(RpcError::new(
                ErrorKind::AlreadyExists,
                format!("handler `{}` is already registered", def.name),
            ));
        }
        self.handlers.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    /// Look up a definition by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<HandlerDef>> {
        self.handlers.get(name).cloned()
    }

    /// All definitions of one kind, sorted by name for stable output.
    #[must_use]
    pub fn list(&self, kind: HandlerKind) -> Vec<Arc<HandlerDef>> {
        let mut defs: Vec<_> = self
            .handlers
            .values()
            .filter(|def| def.kind == kind)
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.handlers.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_procedure(name: &str) -> HandlerDef {
        HandlerDef::procedure(name, |_payload, _ctx| async move { Ok(Value::Null) })
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = Registry::new();
        registry.register(noop_procedure("a")).unwrap();
        let err = registry.register(noop_procedure("a")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_cross_kind_collision_rejected() {
        let mut registry = Registry::new();
        registry.register(noop_procedure("a")).unwrap();
        let err = registry
            .register(HandlerDef::event("a", |_payload, _ctx| async move { Ok(()) }))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_lookup_and_list() {
        let mut registry = Registry::new();
        registry.register(noop_procedure("b")).unwrap();
        registry.register(noop_procedure("a")).unwrap();
        registry
            .register(HandlerDef::event("evt", |_payload, _ctx| async move { Ok(()) }))
            .unwrap();

        assert!(registry.lookup("a").is_some());
        assert!(registry.lookup("missing").is_none());

        let procedures = registry.list(HandlerKind::Procedure);
        let names: Vec<_> = procedures.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(registry.list(HandlerKind::Event).len(), 1);
        assert_eq!(registry.list(HandlerKind::Stream).len(), 0);
    }
}
