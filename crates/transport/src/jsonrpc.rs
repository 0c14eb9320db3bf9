//! JSON-RPC 2.0 adapter over HTTP.
//!
//! `method` addresses the procedure, `params` becomes the payload.
//! Requests without an `id` member are notifications and dispatch as event
//! envelopes with no response entry. Batch requests are processed as an
//! ordered list; responses come back in request order. Error codes derive
//! from the taxonomy through the fixed table in
//! [`ErrorKind::jsonrpc_code`](raffel_core::ErrorKind::jsonrpc_code).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use raffel_core::transport::listen_error;
use raffel_core::{
    Context, Envelope, ErrorKind, Lifecycle, Outcome, Router, RpcError, Transport,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::http::{HttpBody, empty_body, full_body, metadata_from_headers};

const DEFAULT_MAX_BODY: usize = 1024 * 1024;

/// The JSON-RPC 2.0 transport adapter.
pub struct JsonRpcTransport {
    bind: String,
    router: Arc<Router>,
    max_body: usize,
    lifecycle: Lifecycle,
    bound: Mutex<Option<SocketAddr>>,
}

impl JsonRpcTransport {
    /// Serve `router` on `bind`.
    pub fn new(bind: impl Into<String>, router: Arc<Router>) -> Self {
        Self {
            bind: bind.into(),
            router,
            max_body: DEFAULT_MAX_BODY,
            lifecycle: Lifecycle::new(),
            bound: Mutex::new(None),
        }
    }

    /// Hard ceiling on request body size (default 1 MiB).
    #[must_use]
    pub fn max_body_bytes(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }
}

#[async_trait]
impl Transport for JsonRpcTransport {
    fn name(&self) -> &'static str {
        "jsonrpc"
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
        let max_body = self.max_body;
        let shutdown = self.lifecycle.shutdown_token();
        let tracker = self.lifecycle.tracker();
        let force = self.lifecycle.connection_token();
        self.lifecycle.spawn(async move {
            loop {
                let (stream, _peer) = tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("jsonrpc accept failed: {e}");
                            continue;
                        }
                    },
                };
                let router = router.clone();
                let shutdown = shutdown.clone();
                let conn_token = force.child_token();
                let request_token = conn_token.clone();
                tracker.spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let router = router.clone();
                        let request_token = request_token.clone();
                        async move {
                            Ok::<_, Infallible>(
                                serve_rpc(req, &router, max_body, request_token).await,
                            )
                        }
                    });
                    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(conn);
                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(e) = result {
                                tracing::debug!("jsonrpc connection ended: {e}");
                            }
                        }
                        () = shutdown.cancelled() => {
                            conn.as_mut().graceful_shutdown();
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

impl std::fmt::Debug for JsonRpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcTransport").field("bind", &self.bind).finish()
    }
}

async fn serve_rpc(
    req: Request<Incoming>,
    router: &Router,
    max_body: usize,
    conn_token: CancellationToken,
) -> Response<HttpBody> {
    if req.method() != Method::POST {
        return Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(empty_body())
            .unwrap_or_else(|_| Response::new(empty_body()));
    }

    let metadata = metadata_from_headers(req.headers());
    let bytes = match Limited::new(req.into_body(), max_body).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return json_response(&error_object(
                Value::Null,
                ErrorKind::UnprocessableEntity.jsonrpc_code(),
                "request body too large or unreadable",
                None,
            ));
        }
    };

    let parsed: Value = match serde_json::from_slice(&bytes) {
        Ok(parsed) => parsed,
        Err(e) => {
            return json_response(&error_object(
                Value::Null,
                ErrorKind::ParseError.jsonrpc_code(),
                &format!("parse error: {e}"),
                None,
            ));
        }
    };

    match parsed {
        Value::Array(calls) if calls.is_empty() => json_response(&error_object(
            Value::Null,
            ErrorKind::InvalidEnvelope.jsonrpc_code(),
            "empty batch",
            None,
        )),
        Value::Array(calls) => {
            let mut responses = Vec::new();
            for call in calls {
                if let Some(response) =
                    process_call(call, router, &metadata, &conn_token).await
                {
                    responses.push(response);
                }
            }
            if responses.is_empty() {
                no_content()
            } else {
                json_response(&Value::Array(responses))
            }
        }
        single => match process_call(single, router, &metadata, &conn_token).await {
            Some(response) => json_response(&response),
            None => no_content(),
        },
    }
}

/// Handle one call object; `None` for notifications.
async fn process_call(
    call: Value,
    router: &Router,
    metadata: &raffel_core::Metadata,
    conn_token: &CancellationToken,
) -> Option<Value> {
    let id = call.get("id").cloned();
    let Some(object) = call.as_object() else {
        return Some(error_object(
            Value::Null,
            ErrorKind::InvalidEnvelope.jsonrpc_code(),
            "request must be an object",
            None,
        ));
    };
    let Some(method) = object.get("method").and_then(Value::as_str) else {
        return Some(error_object(
            id.unwrap_or(Value::Null),
            ErrorKind::InvalidEnvelope.jsonrpc_code(),
            "missing method",
            None,
        ));
    };
    let params = object.get("params").cloned().unwrap_or(Value::Null);

    let envelope_id = match &id {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => ulid::Ulid::new().to_string(),
    };
    let envelope = if id.is_some() {
        Envelope::request(envelope_id, method, params)
    } else {
        Envelope::event(envelope_id, method, params)
    };
    let ctx = Context::builder()
        .metadata(metadata.clone())
        .parent_token(conn_token.clone())
        .build();

    match router.handle(envelope, ctx).await {
        Outcome::None => None,
        Outcome::Unary(response) => {
            let id = id.unwrap_or(Value::Null);
            match response.error() {
                Some(err) => Some(error_object(
                    id,
                    err.kind.jsonrpc_code(),
                    &err.message,
                    err.details,
                )),
                None => Some(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": response.payload,
                })),
            }
        }
        Outcome::Stream(stream) => {
            // JSON-RPC has no streaming; refuse rather than buffer unbounded.
            drop(stream);
            Some(error_object(
                id.unwrap_or(Value::Null),
                ErrorKind::Unimplemented.jsonrpc_code(),
                "streaming is not supported over JSON-RPC",
                None,
            ))
        }
    }
}

fn error_object(id: Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = serde_json::json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

fn json_response(value: &Value) -> Response<HttpBody> {
    let bytes = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(full_body(bytes.into()))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn no_content() -> Response<HttpBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}
