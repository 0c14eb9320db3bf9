//! UDP adapter: one datagram per envelope, no delivery guarantees.
//!
//! Unary responses go back to the sender as a single datagram; lifted
//! streams emit one datagram per envelope. Events produce nothing. Anything
//! that does not fit the peer's path MTU is the deployment's problem — this
//! adapter is for small, loss-tolerant messages.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use raffel_core::transport::listen_error;
use raffel_core::{Context, Envelope, Lifecycle, Outcome, Router, RpcError, Transport};
use tokio::net::UdpSocket;

const MAX_DATAGRAM: usize = 64 * 1024;

/// The UDP transport adapter.
pub struct UdpTransport {
    bind: String,
    router: Arc<Router>,
    lifecycle: Lifecycle,
    bound: Mutex<Option<SocketAddr>>,
}

impl UdpTransport {
    /// Serve `router` on `bind`.
    pub fn new(bind: impl Into<String>, router: Arc<Router>) -> Self {
        Self {
            bind: bind.into(),
            router,
            lifecycle: Lifecycle::new(),
            bound: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn start(&self) -> Result<(), RpcError> {
        if !self.lifecycle.begin() {
            return Ok(());
        }
        let socket = UdpSocket::bind(&self.bind)
            .await
            .map_err(|e| listen_error(&self.bind, e))?;
        *self.bound.lock() = socket.local_addr().ok();
        let socket = Arc::new(socket);

        let router = self.router.clone();
        let shutdown = self.lifecycle.shutdown_token();
        let tracker = self.lifecycle.tracker();
        let force = self.lifecycle.connection_token();
        self.lifecycle.spawn(async move {
            let mut buf = vec![0_u8; MAX_DATAGRAM];
            loop {
                let (len, peer) = tokio::select! {
                    () = shutdown.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok(received) => received,
                        Err(e) => {
                            tracing::warn!("udp recv failed: {e}");
                            continue;
                        }
                    },
                };
                let datagram = buf[..len].to_vec();
                let router = router.clone();
                let socket = socket.clone();
                let request_token = force.child_token();
                tracker.spawn(async move {
                    let envelope = match Envelope::decode(&datagram) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            // Best-effort error reply; the peer may not listen.
                            let reply = serde_json::json!({ "error": err.to_wire() });
                            if let Ok(bytes) = serde_json::to_vec(&reply) {
                                let _ = socket.send_to(&bytes, peer).await;
                            }
                            return;
                        }
                    };
                    let mut metadata = envelope.metadata.clone();
                    metadata.insert(
                        raffel_core::metadata_keys::CLIENT_IP.to_owned(),
                        peer.ip().to_string(),
                    );
                    let ctx = Context::builder()
                        .metadata(metadata)
                        .parent_token(request_token)
                        .build();
                    match router.handle(envelope, ctx).await {
                        Outcome::None => {}
                        Outcome::Unary(response) => send(&socket, peer, &response).await,
                        Outcome::Stream(mut stream) => {
                            while let Some(envelope) = stream.next().await {
                                send(&socket, peer, &envelope).await;
                            }
                        }
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

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport").field("bind", &self.bind).finish()
    }
}

async fn send(socket: &UdpSocket, peer: SocketAddr, envelope: &Envelope) {
    match envelope.encode() {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                tracing::debug!("udp send failed: {e}");
            }
        }
        Err(e) => tracing::error!("failed to encode envelope: {e}"),
    }
}
