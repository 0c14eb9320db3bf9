//! Per-request state shared across the pipeline.
//!
//! A [`Context`] is created by the adapter that accepted the request and
//! handed to every interceptor and the handler. It is a cheap clone (the
//! state lives behind an `Arc`), so streaming pumps and spawned tasks can
//! carry it without lifetimes.
//!
//! Interceptors mutate the context through `&self` methods (attach auth,
//! tighten the deadline, record response metadata); handlers treat it as
//! read-mostly.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::envelope::{Metadata, metadata_keys};
use crate::extensions::Extensions;

/// Identity attached to a request by the auth interceptor.
#[derive(Clone, Debug, Default)]
pub struct AuthInfo {
    /// Whether a strategy accepted credentials.
    pub authenticated: bool,
    /// Stable identifier of the caller (user id, key id, ...).
    pub principal: Option<String>,
    /// Role names granted to the caller.
    pub roles: Vec<String>,
    /// Free-form claims from the credential.
    pub claims: Value,
}

impl AuthInfo {
    /// An authenticated principal with no roles or claims.
    pub fn principal(principal: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            principal: Some(principal.into()),
            roles: Vec::new(),
            claims: Value::Null,
        }
    }
}

/// Tracing correlation ids for a request.
#[derive(Clone, Debug)]
pub struct TraceInfo {
    /// 32 hex character trace id.
    pub trace_id: String,
    /// 16 hex character span id.
    pub span_id: String,
}

impl TraceInfo {
    /// Parse a W3C `traceparent` header (`00-<trace>-<span>-<flags>`).
    #[must_use]
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        let _version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        if trace_id.len() != 32 || span_id.len() != 16 {
            return None;
        }
        Some(Self {
            trace_id: trace_id.to_owned(),
            span_id: span_id.to_owned(),
        })
    }

    fn generate() -> Self {
        let id = ulid::Ulid::new().0;
        Self {
            trace_id: format!("{id:032x}"),
            span_id: format!("{:016x}", id as u64),
        }
    }
}

struct ContextInner {
    request_id: String,
    cancellation: CancellationToken,
    deadline: Mutex<Option<u64>>,
    auth: RwLock<Option<AuthInfo>>,
    metadata: Metadata,
    response_metadata: Mutex<Metadata>,
    extensions: Mutex<Extensions>,
    trace: TraceInfo,
}

/// Per-request state: id, abort signal, deadline, auth, metadata, slots.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Start building a context. Adapters use this once per request.
    #[must_use]
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// A detached context with a fresh id; handy in tests and internals.
    #[must_use]
    pub fn background() -> Self {
        Self::builder().build()
    }

    /// The request id (honoured from `x-request-id` or generated).
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// The abort token for this request.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Resolves when the request is aborted.
    #[must_use]
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancellation.cancelled()
    }

    /// Whether the request has been aborted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Abort the request. All pending pipeline awaits settle with CANCELLED.
    pub fn abort(&self) {
        self.inner.cancellation.cancel();
    }

    /// Absolute deadline in epoch milliseconds, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<u64> {
        *self.inner.deadline.lock()
    }

    /// Tighten the deadline; a later deadline than the current one is ignored.
    pub fn set_deadline(&self, epoch_ms: u64) {
        let mut slot = self.inner.deadline.lock();
        match *slot {
            Some(current) if current <= epoch_ms => {}
            _ => *slot = Some(epoch_ms),
        }
    }

    /// Milliseconds until the deadline; `None` when no deadline is set.
    #[must_use]
    pub fn time_remaining(&self) -> Option<Duration> {
        let deadline = self.deadline()?;
        Some(Duration::from_millis(deadline.saturating_sub(epoch_ms_now())))
    }

    /// The caller identity, if the auth interceptor attached one.
    #[must_use]
    pub fn auth(&self) -> Option<AuthInfo> {
        self.inner.auth.read().clone()
    }

    /// Attach the caller identity.
    pub fn set_auth(&self, auth: AuthInfo) {
        *self.inner.auth.write() = Some(auth);
    }

    /// Request metadata as received from the transport (read-only).
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    /// Record a metadata entry for the outgoing envelope.
    pub fn set_response_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .response_metadata
            .lock()
            .insert(key.into(), value.into());
    }

    /// Snapshot of metadata recorded for the outgoing envelope.
    #[must_use]
    pub fn take_response_metadata(&self) -> Metadata {
        std::mem::take(&mut *self.inner.response_metadata.lock())
    }

    /// Run a closure against the extension slots.
    pub fn with_extensions<R>(&self, f: impl FnOnce(&mut Extensions) -> R) -> R {
        f(&mut self.inner.extensions.lock())
    }

    /// Tracing correlation ids.
    #[must_use]
    pub fn trace(&self) -> &TraceInfo {
        &self.inner.trace
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.inner.request_id)
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline())
            .finish()
    }
}

/// Builder used by adapters to assemble a [`Context`] from transport state.
#[derive(Default)]
pub struct ContextBuilder {
    request_id: Option<String>,
    parent: Option<CancellationToken>,
    metadata: Metadata,
}

impl ContextBuilder {
    /// Seed request metadata; `x-request-id`, `x-deadline` and `traceparent`
    /// are honoured from it.
    #[must_use]
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Hook cancellation to a transport token (connection close, shutdown).
    #[must_use]
    pub fn parent_token(mut self, token: CancellationToken) -> Self {
        self.parent = Some(token);
        self
    }

    /// Force a request id, overriding metadata.
    #[must_use]
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Assemble the context.
    #[must_use]
    pub fn build(self) -> Context {
        let request_id = self
            .request_id
            .or_else(|| {
                self.metadata
                    .get(metadata_keys::REQUEST_ID)
                    .filter(|v| !v.is_empty())
                    .cloned()
            })
            .unwrap_or_else(|| ulid::Ulid::new().to_string());
        let deadline = self
            .metadata
            .get(metadata_keys::DEADLINE)
            .and_then(|v| v.parse::<u64>().ok());
        let trace = self
            .metadata
            .get(metadata_keys::TRACEPARENT)
            .and_then(|v| TraceInfo::from_traceparent(v))
            .unwrap_or_else(TraceInfo::generate);
        let cancellation = match self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        Context {
            inner: Arc::new(ContextInner {
                request_id,
                cancellation,
                deadline: Mutex::new(deadline),
                auth: RwLock::new(None),
                metadata: self.metadata,
                response_metadata: Mutex::new(Metadata::new()),
                extensions: Mutex::new(Extensions::new()),
                trace,
            }),
        }
    }
}

impl Debug for ContextBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn epoch_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
