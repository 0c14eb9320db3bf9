//! The envelope: Raffel's universal message.
//!
//! Every transport parses its frames into an [`Envelope`] before calling the
//! router, and serialises router output back from envelopes. The shape is
//! identical in memory and on the wire:
//!
//! ```json
//! {"id":"1","procedure":"greet","type":"request","payload":{"name":"World"}}
//! ```
//!
//! The per-request [`Context`](crate::Context) travels next to the envelope
//! in every API, never inside it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ErrorKind, RpcError};

/// Reserved metadata keys, honoured bidirectionally by all adapters.
pub mod metadata_keys {
    /// Propagated or generated request id.
    pub const REQUEST_ID: &str = "x-request-id";
    /// Absolute deadline in milliseconds since the Unix epoch.
    pub const DEADLINE: &str = "x-deadline";
    /// Rate-limit ceiling for the keyed window.
    pub const RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
    /// Requests left in the keyed window.
    pub const RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
    /// Epoch milliseconds at which the keyed window resets.
    pub const RATELIMIT_RESET: &str = "x-ratelimit-reset";
    /// Seconds a rejected client should wait before retrying.
    pub const RETRY_AFTER: &str = "retry-after";
    /// W3C trace context parent.
    pub const TRACEPARENT: &str = "traceparent";
    /// W3C trace context state.
    pub const TRACESTATE: &str = "tracestate";
    /// API-key credential slot.
    pub const API_KEY: &str = "x-api-key";
    /// Bearer/basic credential slot.
    pub const AUTHORIZATION: &str = "authorization";
    /// Transport-provided client address hint.
    pub const CLIENT_IP: &str = "x-client-ip";
}

/// Flat string map carried on every envelope.
///
/// Insertion order is preserved so serialised metadata is stable.
pub type Metadata = IndexMap<String, String>;

/// Discriminates what an envelope means to the router.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum EnvelopeKind {
    /// A unary call expecting exactly one `response` or `error`.
    #[serde(rename = "request")]
    Request,
    /// The single successful answer to a `request`.
    #[serde(rename = "response")]
    Response,
    /// The single failed answer to a `request`.
    #[serde(rename = "error")]
    Error,
    /// Fire-and-forget; yields no response envelope.
    #[serde(rename = "event")]
    Event,
    /// Opens a stream correlation.
    #[serde(rename = "stream:start")]
    StreamStart,
    /// One yielded value within a stream.
    #[serde(rename = "stream:data")]
    StreamData,
    /// Clean stream termination.
    #[serde(rename = "stream:end")]
    StreamEnd,
    /// Erroneous stream termination.
    #[serde(rename = "stream:error")]
    StreamError,
}

impl EnvelopeKind {
    /// Whether this kind terminates a stream correlation.
    #[must_use]
    pub fn is_stream_terminal(&self) -> bool {
        matches!(self, Self::StreamEnd | Self::StreamError)
    }
}

/// The uniform message every adapter and the router exchange.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Envelope {
    /// Opaque correlation id, unique within the originating peer.
    pub id: String,
    /// Dotted identifier of the target handler.
    pub procedure: String,
    /// What this envelope means; serialised as the `type` field.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Opaque payload; validated only if the handler registered a validator.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Flat transport metadata.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Envelope {
    /// Build a `request` envelope.
    pub fn request(id: impl Into<String>, procedure: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            procedure: procedure.into(),
            kind: EnvelopeKind::Request,
            payload,
            metadata: Metadata::new(),
        }
    }

    /// Build an `event` envelope.
    pub fn event(id: impl Into<String>, procedure: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: EnvelopeKind::Event,
            ..Self::request(id, procedure, payload)
        }
    }

    /// The `response` answering this request; id echoes `<id>:response`.
    #[must_use]
    pub fn to_response(&self, payload: Value) -> Self {
        Self {
            id: response_id(&self.id),
            procedure: self.procedure.clone(),
            kind: EnvelopeKind::Response,
            payload,
            metadata: Metadata::new(),
        }
    }

    /// The `error` answering this request; id echoes `<id>:response`.
    #[must_use]
    pub fn to_error(&self, error: &RpcError) -> Self {
        Self {
            id: response_id(&self.id),
            procedure: self.procedure.clone(),
            kind: EnvelopeKind::Error,
            payload: serde_json::json!({ "error": error.to_wire() }),
            metadata: Metadata::new(),
        }
    }

    /// A `stream:*` envelope correlated by this request's id.
    #[must_use]
    pub fn to_stream(&self, kind: EnvelopeKind, payload: Value) -> Self {
        Self {
            id: self.id.clone(),
            procedure: self.procedure.clone(),
            kind,
            payload,
            metadata: Metadata::new(),
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Decode and shape-check one serialised envelope.
    ///
    /// Undecodable bytes are `PARSE_ERROR`; decodable JSON lacking the
    /// minimal `{id, procedure, type}` shape is `INVALID_ENVELOPE`.
    pub fn decode(bytes: &[u8]) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| RpcError::new(ErrorKind::ParseError, format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Shape-check an already-decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, RpcError> {
        if !value.is_object() {
            return Err(RpcError::new(
                ErrorKind::InvalidEnvelope,
                "envelope must be a JSON object",
            ));
        }
        let missing = ["id", "procedure", "type"]
            .into_iter()
            .find(|field| value.get(field).and_then(Value::as_str).is_none_or(str::is_empty));
        if let Some(field) = missing {
            return Err(RpcError::new(
                ErrorKind::InvalidEnvelope,
                format!("envelope is missing `{field}`"),
            ));
        }
        serde_json::from_value(value)
            .map_err(|e| RpcError::new(ErrorKind::InvalidEnvelope, e.to_string()))
    }

    /// Serialise to the wire representation.
    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        serde_json::to_vec(self).map_err(RpcError::from)
    }

    /// Extract the error carried by an `error` or `stream:error` envelope.
    #[must_use]
    pub fn error(&self) -> Option<RpcError> {
        if !matches!(self.kind, EnvelopeKind::Error | EnvelopeKind::StreamError) {
            return None;
        }
        self.payload.get("error").map(RpcError::from_wire)
    }
}

/// Unary response/error correlation id for a request id.
#[must_use]
pub fn response_id(request_id: &str) -> String {
    format!("{request_id}:response")
}
