//! Reference transport adapters for the Raffel runtime.
//!
//! Each adapter implements the [`Transport`](raffel_core::Transport)
//! contract over one protocol and drives the same router:
//!
//! | Feature | Module | Protocol |
//! | --- | --- | --- |
//! | `http` | [`http`] | unary `POST /<procedure>` with JSON bodies |
//! | `sse` | [`sse`] | `GET /streams/<name>` server-sent events |
//! | `ws` | [`ws`] | envelope-per-frame WebSocket with channels |
//! | `tcp` | [`tcp`] | 4-byte big-endian length-prefixed JSON frames |
//! | `udp` | [`udp`] | one datagram per envelope, best effort |
//! | `jsonrpc` | [`jsonrpc`] | JSON-RPC 2.0 over HTTP |
//!
//! The SSE endpoint is served by the HTTP adapter; enabling `sse` extends
//! the HTTP listener with the `/streams/` routes.
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
mod cfg;

pub(crate) mod util;

cfg_feature! {
    #![feature = "http"]

    pub mod http;
    pub use http::HttpTransport;
}

cfg_feature! {
    #![feature = "sse"]

    pub mod sse;
}

cfg_feature! {
    #![feature = "ws"]

    pub mod ws;
    pub use ws::WsTransport;
}

cfg_feature! {
    #![feature = "tcp"]

    pub mod tcp;
    pub use tcp::TcpTransport;
}

cfg_feature! {
    #![feature = "udp"]

    pub mod udp;
    pub use udp::UdpTransport;
}

cfg_feature! {
    #![feature = "jsonrpc"]

    pub mod jsonrpc;
    pub use jsonrpc::JsonRpcTransport;
}
