//! HTTP adapter: unary `POST /<procedure>` plus the SSE streaming routes.
//!
//! Request bodies are JSON payloads (not full envelopes); the adapter
//! builds the envelope, derives the context from the headers (`x-request-id`,
//! `x-deadline`, `traceparent`) and maps the outcome back: `response`
//! envelopes become `200` JSON bodies, `error` envelopes take their status
//! from the error taxonomy, and response metadata (`x-ratelimit-*`,
//! `retry-after`) becomes headers.
//!
//! With the `sse` feature, `GET /streams/<name>` serves stream handlers as
//! `text/event-stream`; the query string becomes the input payload.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn run(router: Arc<raffel_core::Router>) {
//! use raffel_core::Transport;
//! use raffel_transport::HttpTransport;
//!
//! let http = HttpTransport::new("127.0.0.1:8080", router);
//! http.start().await.unwrap();
//! # }
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use raffel_core::transport::listen_error;
use raffel_core::{
    Context, Envelope, ErrorKind, Lifecycle, Metadata, Outcome, Router, RpcError, Transport,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::util::{fold_query_credentials, procedure_from_path, query_to_payload};

/// Response body used by the HTTP-shaped adapters.
pub(crate) type HttpBody = UnsyncBoxBody<Bytes, Infallible>;

const DEFAULT_MAX_BODY: usize = 1024 * 1024;

pub(crate) struct HttpConfig {
    pub(crate) max_body: usize,
    pub(crate) sse_keep_alive: Option<Duration>,
}

/// The HTTP (and SSE) transport adapter.
pub struct HttpTransport {
    bind: String,
    router: Arc<Router>,
    config: Arc<HttpConfig>,
    lifecycle: Lifecycle,
    bound: Mutex<Option<SocketAddr>>,
}

impl HttpTransport {
    /// Serve `router` on `bind` (e.g. `"127.0.0.1:8080"`).
    pub fn new(bind: impl Into<String>, router: Arc<Router>) -> Self {
        Self {
            bind: bind.into(),
            router,
            config: Arc::new(HttpConfig {
                max_body: DEFAULT_MAX_BODY,
                sse_keep_alive: None,
            }),
            lifecycle: Lifecycle::new(),
            bound: Mutex::new(None),
        }
    }

    /// Hard ceiling on request body size (default 1 MiB).
    #[must_use]
    pub fn max_body_bytes(mut self, max_body: usize) -> Self {
        self.config = Arc::new(HttpConfig {
            max_body,
            sse_keep_alive: self.config.sse_keep_alive,
        });
        self
    }

    /// Emit an SSE keep-alive comment when a stream idles this long.
    #[must_use]
    pub fn sse_keep_alive(mut self, interval: Duration) -> Self {
        self.config = Arc::new(HttpConfig {
            max_body: self.config.max_body,
            sse_keep_alive: Some(interval),
        });
        self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn start(&self) -> Result<(), RpcError> {
        if !self.lifecycle.begin() {
            return Ok(());
        }
        let listener = TcpListener::bind(&self.bind)
            .await
            .map_err(|e| listen_error(&self.bind, e))?;
        *self.bound.lock() = listener.local_addr().ok();

        let router = self.router.clone();
        let config = self.config.clone();
        let shutdown = self.lifecycle.shutdown_token();
        let tracker = self.lifecycle.tracker();
        let make_conn_token = {
            let lifecycle_force = self.lifecycle.connection_token();
            move || lifecycle_force.child_token()
        };
        self.lifecycle.spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("http accept failed: {e}");
                            continue;
                        }
                    },
                };
                let router = router.clone();
                let config = config.clone();
                let shutdown = shutdown.clone();
                let conn_token = make_conn_token();
                let request_token = conn_token.clone();
                tracker.spawn(async move {
                    let service_shutdown = shutdown.clone();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let router = router.clone();
                        let config = config.clone();
                        let request_token = request_token.clone();
                        let shutdown = service_shutdown.clone();
                        async move {
                            Ok::<_, Infallible>(
                                serve_request(req, peer, &router, &config, request_token, shutdown)
                                    .await,
                            )
                        }
                    });
                    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(conn);
                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(e) = result {
                                tracing::debug!("http connection ended: {e}");
                            }
                        }
                        () = shutdown.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            // Drain until done, or drop hard on force-close.
                            tokio::select! {
                                _ = conn.as_mut() => {}
                                () = conn_token.cancelled() => {}
                            }
                        }
                        () = conn_token.cancelled() => {}
                    }
                });
            }
        });
        Ok(())
    }

    async fn stop(&self, grace: Duration) -> Result<(), RpcError> {
        self.lifecycle.stop(grace).await;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").field("bind", &self.bind).finish()
    }
}

async fn serve_request(
    req: Request<Incoming>,
    peer: SocketAddr,
    router: &Router,
    config: &HttpConfig,
    conn_token: CancellationToken,
    shutdown: CancellationToken,
) -> Response<HttpBody> {
    let path = req.uri().path().to_owned();

    #[cfg(feature = "sse")]
    if req.method() == Method::GET && path.starts_with("/streams/") {
        return serve_stream(req, peer, router, config, conn_token, shutdown).await;
    }
    #[cfg(not(feature = "sse"))]
    let _ = shutdown;

    if req.method() != Method::POST {
        return error_response(&RpcError::new(
            ErrorKind::NotFound,
            format!("no route for {} {}", req.method(), path),
        ));
    }
    if let Err(e) = check_content_type(&req) {
        return error_response(&e);
    }

    let mut metadata = metadata_from_headers(req.headers());
    metadata.insert(
        raffel_core::metadata_keys::CLIENT_IP.to_owned(),
        peer.ip().to_string(),
    );
    let ctx = Context::builder()
        .metadata(metadata.clone())
        .parent_token(conn_token)
        .build();

    let payload = match read_payload(req, config.max_body).await {
        Ok(payload) => payload,
        Err(e) => return error_response(&e),
    };
    let mut envelope = Envelope::request(
        ulid::Ulid::new().to_string(),
        procedure_from_path(&path),
        payload,
    );
    envelope.metadata = metadata;

    match router.handle(envelope, ctx.clone()).await {
        Outcome::Unary(response) => unary_response(&response),
        Outcome::None => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(empty_body())
            .unwrap_or_else(|_| Response::new(empty_body())),
        #[cfg(feature = "sse")]
        Outcome::Stream(stream) => crate::sse::response(stream, ctx, config.sse_keep_alive),
        #[cfg(not(feature = "sse"))]
        Outcome::Stream(_) => error_response(&RpcError::new(
            ErrorKind::Unimplemented,
            "streaming requires the sse feature",
        )),
    }
}

#[cfg(feature = "sse")]
async fn serve_stream(
    req: Request<Incoming>,
    peer: SocketAddr,
    router: &Router,
    config: &HttpConfig,
    conn_token: CancellationToken,
    shutdown: CancellationToken,
) -> Response<HttpBody> {
    let path = req.uri().path().to_owned();
    let query = req.uri().query().unwrap_or("").to_owned();
    let procedure = procedure_from_path(path.trim_start_matches("/streams"));

    let mut metadata = metadata_from_headers(req.headers());
    fold_query_credentials(&query, &mut metadata);
    metadata.insert(
        raffel_core::metadata_keys::CLIENT_IP.to_owned(),
        peer.ip().to_string(),
    );
    let ctx = Context::builder()
        .metadata(metadata.clone())
        .parent_token(conn_token)
        .build();

    let mut envelope = Envelope::request(
        ulid::Ulid::new().to_string(),
        procedure,
        query_to_payload(&query),
    );
    envelope.metadata = metadata;

    match router.handle(envelope, ctx.clone()).await {
        Outcome::Stream(stream) => {
            // A server stop signals running streams to terminate; the
            // watcher exits once the response body releases the context.
            let watched = ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = shutdown.cancelled() => watched.abort(),
                    () = watched.cancelled() => {}
                }
            });
            crate::sse::response(stream, ctx, config.sse_keep_alive)
        }
        Outcome::Unary(response) => unary_response(&response),
        Outcome::None => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(empty_body())
            .unwrap_or_else(|_| Response::new(empty_body())),
    }
}

fn check_content_type(req: &Request<Incoming>) -> Result<(), RpcError> {
    let Some(value) = req.headers().get(CONTENT_TYPE) else {
        return Ok(());
    };
    let ok = value
        .to_str()
        .ok()
        .and_then(|v| v.parse::<mime::Mime>().ok())
        .is_some_and(|m| {
            m.type_() == mime::APPLICATION && (m.subtype() == mime::JSON || m.suffix() == Some(mime::JSON))
        });
    if ok {
        Ok(())
    } else {
        Err(RpcError::invalid_argument("unsupported content type"))
    }
}

async fn read_payload(req: Request<Incoming>, max_body: usize) -> Result<Value, RpcError> {
    let body = Limited::new(req.into_body(), max_body);
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<http_body_util::LengthLimitError>() => {
            return Err(RpcError::new(
                ErrorKind::UnprocessableEntity,
                format!("request body exceeds {max_body} bytes"),
            ));
        }
        Err(e) => return Err(RpcError::internal(format!("failed to read body: {e}"))),
    };
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| RpcError::new(ErrorKind::ParseError, format!("invalid JSON body: {e}")))
}

pub(crate) fn metadata_from_headers(headers: &hyper::HeaderMap) -> Metadata {
    let mut metadata = Metadata::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            metadata.insert(name.as_str().to_owned(), value.to_owned());
        }
    }
    metadata
}

/// Serialise a unary router outcome into an HTTP response.
pub(crate) fn unary_response(envelope: &Envelope) -> Response<HttpBody> {
    let (status, body) = match envelope.error() {
        Some(err) => (
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            envelope.payload.clone(),
        ),
        None => (StatusCode::OK, envelope.payload.clone()),
    };
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"null".to_vec());
    let mut response = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (key, value) in &envelope.metadata {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(key.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            response = response.header(name, value);
        }
    }
    response
        .body(full_body(Bytes::from(bytes)))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

pub(crate) fn error_response(err: &RpcError) -> Response<HttpBody> {
    let body = serde_json::json!({ "error": err.to_wire() });
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"null".to_vec());
    Response::builder()
        .status(StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(full_body(Bytes::from(bytes)))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

pub(crate) fn full_body(bytes: Bytes) -> HttpBody {
    Full::new(bytes).boxed_unsync()
}

pub(crate) fn empty_body() -> HttpBody {
    Full::new(Bytes::new()).boxed_unsync()
}
