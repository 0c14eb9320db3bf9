//! WebSocket adapter: envelope-per-frame RPC plus channel pub/sub.
//!
//! Client frames carry a `type` field:
//!
//! * `subscribe` / `unsubscribe` / `publish` target the
//!   [`ChannelManager`]; `publish` requires membership of the channel;
//! * `request` / `event` / `stream:start` target the router;
//! * `stream:cancel` aborts the context of a running stream by its id.
//!
//! Each socket has a bounded outbound queue drained by one writer task;
//! channel broadcasts that find the queue full are dropped with a log line
//! rather than stalling the whole channel. Stream pumps, in contrast, await
//! queue capacity, which backpressures the producing handler.
//!
//! Closing the socket unsubscribes it everywhere and aborts its in-flight
//! request contexts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use raffel_core::transport::listen_error;
use raffel_core::{
    ChannelManager, ChannelMessage, Context, Envelope, ErrorKind, Lifecycle, Metadata, Outcome,
    Router, RpcError, SocketId, SocketSender, Transport,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_util::sync::CancellationToken;

use crate::util::fold_query_credentials;

const DEFAULT_OUTBOUND_QUEUE: usize = 64;

/// Delivers channel messages into per-socket outbound queues.
///
/// Handed to the [`ChannelManager`] constructor; the transport registers
/// sockets as they connect. Delivery is non-blocking: a full queue drops
/// the message for that socket.
#[derive(Clone, Default)]
pub struct WsSender {
    sockets: Arc<Mutex<HashMap<SocketId, mpsc::Sender<Message>>>>,
}

impl WsSender {
    fn register(&self, socket_id: &str, tx: mpsc::Sender<Message>) {
        self.sockets.lock().insert(socket_id.to_owned(), tx);
    }

    fn unregister(&self, socket_id: &str) {
        self.sockets.lock().remove(socket_id);
    }
}

impl SocketSender for WsSender {
    fn send(&self, socket_id: &str, message: ChannelMessage) {
        let Some(tx) = self.sockets.lock().get(socket_id).cloned() else {
            return;
        };
        let Ok(text) = serde_json::to_string(&message) else {
            return;
        };
        if tx.try_send(Message::text(text)).is_err() {
            tracing::warn!(socket = socket_id, "outbound queue full, dropping channel message");
        }
    }
}

impl std::fmt::Debug for WsSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSender")
            .field("sockets", &self.sockets.lock().len())
            .finish()
    }
}

/// The WebSocket transport adapter.
pub struct WsTransport {
    bind: String,
    router: Arc<Router>,
    sender: WsSender,
    channels: Arc<ChannelManager>,
    outbound_queue: usize,
    lifecycle: Lifecycle,
    bound: Mutex<Option<SocketAddr>>,
}

impl WsTransport {
    /// Serve `router` on `bind` with an unauthorized channel manager.
    ///
    /// Use [`with_channels`](Self::with_channels) to configure channel
    /// authorisation and presence data.
    pub fn new(bind: impl Into<String>, router: Arc<Router>) -> Self {
        let sender = WsSender::default();
        let channels = Arc::new(ChannelManager::new(sender.clone()));
        Self {
            bind: bind.into(),
            router,
            sender,
            channels,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            lifecycle: Lifecycle::new(),
            bound: Mutex::new(None),
        }
    }

    /// Replace the channel manager; the closure receives the socket sender
    /// this transport delivers through.
    #[must_use]
    pub fn with_channels(mut self, f: impl FnOnce(WsSender) -> ChannelManager) -> Self {
        self.channels = Arc::new(f(self.sender.clone()));
        self
    }

    /// Outbound frame queue depth per socket (default 64).
    #[must_use]
    pub fn outbound_queue(mut self, depth: usize) -> Self {
        self.outbound_queue = depth.max(1);
        self
    }

    /// The channel manager serving this transport.
    #[must_use]
    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "ws"
    }

    async fn start(&self) -> Result<(), RpcError> {
        if !self.lifecycle.begin() {
            return Ok(());
        }
        let listener = TcpListener::bind(&self.bind)
            .await
            .map_err(|e| listen_error(&self.bind, e))?;
        *self.bound.lock() = listener.local_addr().ok();

        let shutdown = self.lifecycle.shutdown_token();
        let tracker = self.lifecycle.tracker();
        let force = self.lifecycle.connection_token();
        let shared = Arc::new(Shared {
            router: self.router.clone(),
            channels: self.channels.clone(),
            sender: self.sender.clone(),
            tracker: tracker.clone(),
            outbound_queue: self.outbound_queue,
        });
        self.lifecycle.spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("ws accept failed: {e}");
                            continue;
                        }
                    },
                };
                let shared = shared.clone();
                let conn_token = force.child_token();
                let shutdown = shutdown.clone();
                tracker.spawn(async move {
                    if let Err(e) = serve_socket(stream, peer, shared, conn_token, shutdown).await {
                        tracing::debug!("ws connection ended: {}", e.message);
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

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport").field("bind", &self.bind).finish()
    }
}

struct Shared {
    router: Arc<Router>,
    channels: Arc<ChannelManager>,
    sender: WsSender,
    tracker: tokio_util::task::TaskTracker,
    outbound_queue: usize,
}

/// One client frame, discriminated by `type`.
#[derive(Deserialize, Debug)]
struct ClientFrame {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    channel: Option<String>,
    event: Option<String>,
    data: Option<Value>,
    procedure: Option<String>,
    payload: Option<Value>,
    metadata: Option<Metadata>,
}

async fn serve_socket(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    conn_token: CancellationToken,
    shutdown: CancellationToken,
) -> Result<(), RpcError> {
    let mut handshake_metadata = Metadata::new();
    let callback = |req: &HandshakeRequest,
                    response: HandshakeResponse|
     -> Result<HandshakeResponse, ErrorResponse> {
        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                handshake_metadata.insert(name.as_str().to_owned(), value.to_owned());
            }
        }
        if let Some(query) = req.uri().query() {
            fold_query_credentials(query, &mut handshake_metadata);
        }
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, format!("ws handshake: {e}")))?;
    handshake_metadata.insert(
        raffel_core::metadata_keys::CLIENT_IP.to_owned(),
        peer.ip().to_string(),
    );

    let socket_id: SocketId = ulid::Ulid::new().to_string();
    let (mut sink, mut frames) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Message>(shared.outbound_queue);
    shared.sender.register(&socket_id, tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let conn_ctx = Context::builder()
        .metadata(handshake_metadata.clone())
        .parent_token(conn_token.clone())
        .build();
    let active_streams: Arc<Mutex<HashMap<String, Context>>> = Arc::new(Mutex::new(HashMap::new()));

    // Whether the peer (rather than a server stop) ended the session.
    let mut peer_gone = false;
    loop {
        let message = tokio::select! {
            () = conn_token.cancelled() => break,
            () = shutdown.cancelled() => {
                // Server stop: streams are signalled to terminate, in-flight
                // unary requests run to completion.
                for ctx in active_streams.lock().values() {
                    ctx.abort();
                }
                break;
            }
            message = frames.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                handle_frame(
                    text.as_str(),
                    &socket_id,
                    &shared,
                    &conn_ctx,
                    &handshake_metadata,
                    &conn_token,
                    &tx,
                    &active_streams,
                )
                .await;
            }
            Some(Ok(Message::Close(_))) | None => {
                peer_gone = true;
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(socket = %socket_id, "ws read failed: {e}");
                peer_gone = true;
                break;
            }
        }
    }

    shared.channels.unsubscribe_all(&socket_id);
    shared.sender.unregister(&socket_id);
    if peer_gone {
        conn_token.cancel();
    }
    drop(tx);
    let _ = writer.await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    text: &str,
    socket_id: &str,
    shared: &Arc<Shared>,
    conn_ctx: &Context,
    conn_metadata: &Metadata,
    conn_token: &CancellationToken,
    tx: &mpsc::Sender<Message>,
    active_streams: &Arc<Mutex<HashMap<String, Context>>>,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            let err = RpcError::new(ErrorKind::ParseError, format!("invalid frame: {e}"));
            send_control_error(tx, "unknown", &err).await;
            return;
        }
    };
    let frame_id = frame.id.clone().unwrap_or_else(|| "unknown".to_owned());

    match frame.kind.as_str() {
        "subscribe" => {
            let Some(channel) = frame.channel else {
                let err = RpcError::invalid_argument("subscribe requires `channel`");
                send_control_error(tx, &frame_id, &err).await;
                return;
            };
            match shared.channels.subscribe(socket_id, &channel, conn_ctx).await {
                Ok(result) => {
                    let mut payload = serde_json::json!({ "success": true, "channel": channel });
                    if let Some(members) = result.members {
                        payload["members"] =
                            serde_json::to_value(members).unwrap_or(Value::Null);
                    }
                    send_control_response(tx, &frame_id, payload).await;
                }
                Err(err) => send_control_error(tx, &frame_id, &err).await,
            }
        }
        "unsubscribe" => {
            let Some(channel) = frame.channel else {
                let err = RpcError::invalid_argument("unsubscribe requires `channel`");
                send_control_error(tx, &frame_id, &err).await;
                return;
            };
            let success = shared.channels.unsubscribe(socket_id, &channel);
            send_control_response(
                tx,
                &frame_id,
                serde_json::json!({ "success": success, "channel": channel }),
            )
            .await;
        }
        "publish" => {
            let (Some(channel), Some(event)) = (frame.channel, frame.event) else {
                let err = RpcError::invalid_argument("publish requires `channel` and `event`");
                send_control_error(tx, &frame_id, &err).await;
                return;
            };
            let member = shared
                .channels
                .channels_of(socket_id)
                .iter()
                .any(|c| c == &channel);
            if !member {
                let err = RpcError::new(
                    ErrorKind::PermissionDenied,
                    format!("publish to `{channel}` requires subscription"),
                );
                send_control_error(tx, &frame_id, &err).await;
                return;
            }
            shared.channels.broadcast(
                &channel,
                &event,
                frame.data.unwrap_or(Value::Null),
                Some(socket_id),
            );
            send_control_response(
                tx,
                &frame_id,
                serde_json::json!({ "success": true, "channel": channel }),
            )
            .await;
        }
        "request" | "event" | "stream:start" => {
            let Some(procedure) = frame.procedure else {
                let err = RpcError::invalid_argument("dispatch requires `procedure`");
                send_control_error(tx, &frame_id, &err).await;
                return;
            };
            let mut metadata = conn_metadata.clone();
            if let Some(extra) = frame.metadata {
                metadata.extend(extra);
            }
            let mut envelope = if frame.kind == "event" {
                Envelope::event(frame_id.clone(), procedure, frame.payload.unwrap_or(Value::Null))
            } else {
                Envelope::request(frame_id.clone(), procedure, frame.payload.unwrap_or(Value::Null))
            };
            envelope.metadata = metadata.clone();

            let ctx = Context::builder()
                .metadata(metadata)
                .parent_token(conn_token.clone())
                .build();
            if frame.kind == "stream:start" {
                active_streams.lock().insert(frame_id.clone(), ctx.clone());
            }

            let router = shared.router.clone();
            let tx = tx.clone();
            let active_streams = active_streams.clone();
            let is_stream = frame.kind == "stream:start";
            shared.tracker.spawn(async move {
                match router.handle(envelope, ctx).await {
                    Outcome::None => {}
                    Outcome::Unary(response) => send_envelope(&tx, &response).await,
                    Outcome::Stream(mut stream) => {
                        while let Some(envelope) = stream.next().await {
                            send_envelope(&tx, &envelope).await;
                        }
                    }
                }
                if is_stream {
                    active_streams.lock().remove(&frame_id);
                }
            });
        }
        "stream:cancel" => {
            if let Some(ctx) = active_streams.lock().remove(&frame_id) {
                ctx.abort();
            }
        }
        other => {
            let err = RpcError::invalid_argument(format!("unknown frame type `{other}`"));
            send_control_error(tx, &frame_id, &err).await;
        }
    }
}

async fn send_envelope(tx: &mpsc::Sender<Message>, envelope: &Envelope) {
    match serde_json::to_string(envelope) {
        Ok(text) => {
            let _ = tx.send(Message::text(text)).await;
        }
        Err(e) => tracing::error!("failed to encode envelope: {e}"),
    }
}

async fn send_control_response(tx: &mpsc::Sender<Message>, id: &str, payload: Value) {
    let frame = serde_json::json!({ "id": id, "type": "response", "payload": payload });
    let _ = tx.send(Message::text(frame.to_string())).await;
}

async fn send_control_error(tx: &mpsc::Sender<Message>, id: &str, err: &RpcError) {
    let frame = serde_json::json!({
        "id": id,
        "type": "error",
        "payload": { "error": err.to_wire() },
    });
    let _ = tx.send(Message::text(frame.to_string())).await;
}
