//! Raffel is a protocol-agnostic RPC runtime: register handlers once, serve
//! them over HTTP, SSE, WebSocket, framed TCP, UDP and JSON-RPC at the same
//! time.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use raffel::prelude::*;
//! use raffel::transport::HttpTransport;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> raffel::Result<()> {
//!     let mut registry = Registry::new();
//!     registry.register(HandlerDef::procedure("greet", |payload, _ctx| async move {
//!         let name = payload["name"].as_str().unwrap_or("world");
//!         Ok(json!({ "message": format!("Hello, {name}!") }))
//!     }))?;
//!
//!     let router = Arc::new(Router::new(Arc::new(registry)));
//!     let server = Server::new().transport(HttpTransport::new("127.0.0.1:8080", router));
//!     server.start().await?;
//!     // ... run until a shutdown signal ...
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
mod cfg;

pub use raffel_core as core;
#[doc(no_inline)]
pub use raffel_core::*;

cfg_feature! {
    #![feature = "extra"]
    #[doc(no_inline)]
    pub use raffel_extra::auth;
    #[doc(no_inline)]
    pub use raffel_extra::logging;
    #[doc(no_inline)]
    pub use raffel_extra::metrics;
    #[doc(no_inline)]
    pub use raffel_extra::timeout;
}

cfg_feature! {
    #![feature = "rate-limiter"]
    #[doc(no_inline)]
    pub use raffel_rate_limiter as rate_limiter;
}

cfg_feature! {
    #![feature = "transport"]
    #[doc(no_inline)]
    pub use raffel_transport as transport;
}
