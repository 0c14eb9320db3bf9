//! The core crate of the Raffel RPC runtime.
//!
//! Raffel exposes one set of handlers over several wire protocols at once.
//! This crate is the protocol-agnostic half: the envelope and error model,
//! the per-request context, the bounded stream primitive, the handler
//! registry, the router with its interceptor pipeline, the channel manager
//! and the transport contract. The reference adapters live in
//! `raffel-transport`; the stock interceptors in `raffel_extra` and
//! `raffel-rate-limiter`.
//!
//! # A minimal server
//!
//! ```
//! use std::sync::Arc;
//!
//! use raffel_core::{Envelope, Context, HandlerDef, Outcome, Registry, Router};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut registry = Registry::new();
//! registry
//!     .register(HandlerDef::procedure("greet", |payload, _ctx| async move {
//!         let name = payload["name"].as_str().unwrap_or("world");
//!         Ok(json!({ "message": format!("Hello, {name}!") }))
//!     }))
//!     .unwrap();
//!
//! let router = Router::new(Arc::new(registry));
//! let request = Envelope::request("1", "greet", json!({ "name": "World" }));
//! match router.handle(request, Context::background()).await {
//!     Outcome::Unary(response) => {
//!         assert_eq!(response.payload["message"], "Hello, World!");
//!     }
//!     _ => unreachable!(),
//! }
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Re-export of `async_trait` for implementing the handler and interceptor
/// traits without a direct dependency.
pub use async_trait::async_trait;

pub mod channel;
mod context;
pub mod envelope;
mod error;
mod extensions;
mod handler;
pub mod hooks;
mod registry;
mod router;
mod server;
pub mod stream;
pub mod transport;
mod validate;

pub use self::channel::{ChannelManager, ChannelMessage, MemberInfo, SocketId, SocketSender};
pub use self::context::{AuthInfo, Context, ContextBuilder, TraceInfo, epoch_ms_now};
pub use self::envelope::{Envelope, EnvelopeKind, Metadata, metadata_keys, response_id};
pub use self::error::{ErrorKind, RpcError};
pub use self::extensions::Extensions;
pub use self::handler::{Reply, RpcHandler};
pub use self::hooks::Hooks;
pub use self::registry::{HandlerDef, HandlerKind, Registry, StreamDirection};
pub use self::router::{EnvelopeStream, Interceptor, Next, Outcome, Router};
pub use self::server::Server;
pub use self::stream::{RaffelStream, StreamIter, StreamOptions, StreamState};
pub use self::transport::{Lifecycle, Transport};
pub use self::validate::{RequiredFields, Validator};

/// Result type defaulting to [`RpcError`].
pub type Result<T> = std::result::Result<T, RpcError>;

/// Commonly used items, star-importable by applications.
pub mod prelude {
    pub use async_trait::async_trait;

    pub use crate::channel::{ChannelManager, ChannelMessage, SocketSender};
    pub use crate::context::{AuthInfo, Context};
    pub use crate::envelope::{Envelope, EnvelopeKind, Metadata};
    pub use crate::error::{ErrorKind, RpcError};
    pub use crate::hooks::Hooks;
    pub use crate::registry::{HandlerDef, HandlerKind, Registry};
    pub use crate::router::{Interceptor, Next, Outcome, Router};
    pub use crate::server::Server;
    pub use crate::stream::RaffelStream;
    pub use crate::transport::Transport;
}
