//! Framed TCP adapter: 4-byte big-endian length prefix, one JSON envelope
//! per frame.
//!
//! Requests on one connection may pipeline; each is dispatched on its own
//! task and correlated by envelope id. Outbound frames flow through a
//! bounded queue, so a stalled peer suspends stream handlers through the
//! stream primitive's backpressure.
//!
//! Protocol errors are graded: an undecodable frame earns a `PARSE_ERROR`
//! (or `INVALID_ENVELOPE`) error envelope and the connection stays open; a
//! frame exceeding the size ceiling is `DATA_LOSS` and closes the
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use raffel_core::transport::listen_error;
use raffel_core::{
    Context, Envelope, EnvelopeKind, ErrorKind, Lifecycle, Metadata, Outcome, Router, RpcError,
    Transport,
};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_FRAME: usize = 1024 * 1024;
const DEFAULT_WRITE_QUEUE: usize = 64;

/// The framed TCP transport adapter.
pub struct TcpTransport {
    bind: String,
    router: Arc<Router>,
    max_frame: usize,
    write_queue: usize,
    lifecycle: Lifecycle,
    bound: Mutex<Option<SocketAddr>>,
}

impl TcpTransport {
    /// Serve `router` on `bind`.
    pub fn new(bind: impl Into<String>, router: Arc<Router>) -> Self {
        Self {
            bind: bind.into(),
            router,
            max_frame: DEFAULT_MAX_FRAME,
            write_queue: DEFAULT_WRITE_QUEUE,
            lifecycle: Lifecycle::new(),
            bound: Mutex::new(None),
        }
    }

    /// Per-connection frame size ceiling (default 1 MiB).
    #[must_use]
    pub fn max_frame_bytes(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Outbound frame queue depth per connection (default 64).
    #[must_use]
    pub fn write_queue(mut self, depth: usize) -> Self {
        self.write_queue = depth.max(1);
        self
    }

    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(self.max_frame)
            .new_codec()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
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
        let codec = self.codec();
        let write_queue = self.write_queue;
        let shutdown = self.lifecycle.shutdown_token();
        let tracker = self.lifecycle.tracker();
        let force = self.lifecycle.connection_token();
        self.lifecycle.spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("tcp accept failed: {e}");
                            continue;
                        }
                    },
                };
                let conn = Connection {
                    router: router.clone(),
                    peer,
                    shutdown: shutdown.clone(),
                    conn_token: force.child_token(),
                    tracker: tracker.clone(),
                    write_queue,
                };
                let codec = codec.clone();
                tracker.spawn(async move { conn.run(stream, codec).await });
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

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport").field("bind", &self.bind).finish()
    }
}

struct Connection {
    router: Arc<Router>,
    peer: SocketAddr,
    shutdown: CancellationToken,
    conn_token: CancellationToken,
    tracker: tokio_util::task::TaskTracker,
    write_queue: usize,
}

impl Connection {
    async fn run(self, stream: tokio::net::TcpStream, codec: LengthDelimitedCodec) {
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, codec.clone());
        let (tx, rx) = mpsc::channel::<Bytes>(self.write_queue);

        let writer = tokio::spawn(write_loop(FramedWrite::new(write_half, codec), rx));

        // Whether the peer (rather than a server stop) ended the session.
        let mut peer_gone = false;
        loop {
            let frame = tokio::select! {
                () = self.conn_token.cancelled() => break,
                () = self.shutdown.cancelled() => break,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(bytes)) => match Envelope::decode(&bytes) {
                    Ok(envelope) => self.dispatch(envelope, tx.clone()),
                    Err(err) => {
                        tracing::debug!(peer = %self.peer, "bad tcp frame: {}", err.message);
                        send_envelope(&tx, &protocol_error(&err)).await;
                    }
                },
                Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    // Oversize frame: report DATA_LOSS and drop the peer.
                    let err = RpcError::new(ErrorKind::DataLoss, "frame exceeds size ceiling");
                    send_envelope(&tx, &protocol_error(&err)).await;
                    peer_gone = true;
                    break;
                }
                Some(Err(e)) => {
                    tracing::debug!(peer = %self.peer, "tcp read failed: {e}");
                    peer_gone = true;
                    break;
                }
                None => {
                    peer_gone = true;
                    break;
                }
            }
        }
        if peer_gone {
            // The peer is gone: abort its in-flight requests. On a server
            // stop, unary requests finish and stream pumps see the shutdown
            // signal instead.
            self.conn_token.cancel();
        }
        drop(tx);
        let _ = writer.await;
    }

    fn dispatch(&self, envelope: Envelope, tx: mpsc::Sender<Bytes>) {
        let router = self.router.clone();
        let shutdown = self.shutdown.clone();
        let mut metadata = envelope.metadata.clone();
        metadata.insert(
            raffel_core::metadata_keys::CLIENT_IP.to_owned(),
            self.peer.ip().to_string(),
        );
        let ctx = Context::builder()
            .metadata(metadata)
            .parent_token(self.conn_token.clone())
            .build();
        self.tracker.spawn(async move {
            match router.handle(envelope, ctx.clone()).await {
                Outcome::Unary(response) => send_envelope(&tx, &response).await,
                Outcome::None => {}
                Outcome::Stream(mut stream) => {
                    let mut aborted = false;
                    loop {
                        tokio::select! {
                            () = shutdown.cancelled(), if !aborted => {
                                // Server stopping: signal the stream to end.
                                ctx.abort();
                                aborted = true;
                            }
                            item = stream.next() => match item {
                                Some(envelope) => send_envelope(&tx, &envelope).await,
                                None => break,
                            },
                        }
                    }
                }
            }
        });
    }
}

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    mut rx: mpsc::Receiver<Bytes>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = sink.send(bytes).await {
            tracing::debug!("tcp write failed: {e}");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn send_envelope(tx: &mpsc::Sender<Bytes>, envelope: &Envelope) {
    match envelope.encode() {
        Ok(bytes) => {
            let _ = tx.send(Bytes::from(bytes)).await;
        }
        Err(e) => tracing::error!("failed to encode envelope: {e}"),
    }
}

/// Error envelope for frames that never became a request.
fn protocol_error(err: &RpcError) -> Envelope {
    Envelope {
        id: "unknown".to_owned(),
        procedure: String::new(),
        kind: EnvelopeKind::Error,
        payload: serde_json::json!({ "error": err.to_wire() }),
        metadata: Metadata::new(),
    }
}

#[cfg(test)]
mod tests {
    use raffel_core::{HandlerDef, Registry};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    fn test_router() -> Arc<Router> {
        let mut registry = Registry::new();
        registry
            .register(HandlerDef::procedure("greet", |payload, _ctx| async move {
                let name = payload["name"].as_str().unwrap_or("world").to_owned();
                Ok(serde_json::json!({ "message": format!("Hello, {name}!") }))
            }))
            .unwrap();
        registry
            .register(HandlerDef::stream_writer("count", |payload, _ctx, stream| async move {
                let n = payload["count"].as_u64().unwrap_or(0);
                for i in 1..=n {
                    stream.write(serde_json::json!({ "value": i })).await?;
                }
                Ok(())
            }))
            .unwrap();
        Arc::new(Router::new(Arc::new(registry)))
    }

    async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
        let len = (payload.len() as u32).to_be_bytes();
        stream.write_all(&len).await.unwrap();
        stream.write_all(payload).await.unwrap();
    }

    async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut len = [0_u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut body = vec![0_u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn test_greet_round_trip() {
        let transport = TcpTransport::new("127.0.0.1:0", test_router());
        transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut stream,
            br#"{"id":"1","procedure":"greet","type":"request","payload":{"name":"World"}}"#,
        )
        .await;
        let response = read_frame(&mut stream).await;
        assert_eq!(
            String::from_utf8(response).unwrap(),
            r#"{"id":"1:response","procedure":"greet","type":"response","payload":{"message":"Hello, World!"}}"#
        );

        transport.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_json_keeps_connection_open() {
        let transport = TcpTransport::new("127.0.0.1:0", test_router());
        transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, b"{not json").await;
        let error_frame = read_frame(&mut stream).await;
        let envelope = Envelope::decode(&error_frame).unwrap();
        assert_eq!(envelope.error().unwrap().kind, ErrorKind::ParseError);

        // Connection survives: a valid request still works.
        write_frame(
            &mut stream,
            br#"{"id":"2","procedure":"greet","type":"request","payload":{}}"#,
        )
        .await;
        let response = Envelope::decode(&read_frame(&mut stream).await).unwrap();
        assert_eq!(response.id, "2:response");

        transport.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_over_tcp() {
        let transport = TcpTransport::new("127.0.0.1:0", test_router());
        transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut stream,
            br#"{"id":"s1","procedure":"count","type":"request","payload":{"count":2}}"#,
        )
        .await;
        let mut kinds = Vec::new();
        loop {
            let envelope = Envelope::decode(&read_frame(&mut stream).await).unwrap();
            let terminal = envelope.kind.is_stream_terminal();
            kinds.push(envelope.kind);
            if terminal {
                break;
            }
        }
        assert_eq!(
            kinds,
            vec![
                EnvelopeKind::StreamStart,
                EnvelopeKind::StreamData,
                EnvelopeKind::StreamData,
                EnvelopeKind::StreamEnd,
            ]
        );

        transport.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversize_frame_closes_with_data_loss() {
        let transport = TcpTransport::new("127.0.0.1:0", test_router()).max_frame_bytes(64);
        transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let big = format!(
            r#"{{"id":"1","procedure":"greet","type":"request","payload":{{"name":"{}"}}}}"#,
            "x".repeat(256)
        );
        write_frame(&mut stream, big.as_bytes()).await;
        let envelope = Envelope::decode(&read_frame(&mut stream).await).unwrap();
        assert_eq!(envelope.error().unwrap().kind, ErrorKind::DataLoss);
        // Server closes the connection after DATA_LOSS.
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        transport.stop(Duration::from_secs(1)).await.unwrap();
    }
}
