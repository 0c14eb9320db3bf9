//! Server-Sent Events egress for lifted streams.
//!
//! Each `stream:data` envelope becomes one `event: data` frame carrying the
//! payload as JSON; a `stream:error` terminator becomes a final
//! `event: error` frame. `stream:start` and `stream:end` emit nothing — the
//! response itself opens and closes the stream. An optional keep-alive
//! emits `: ping` comments while the handler is quiet.
//!
//! Dropping the response body (the client went away) aborts the request
//! context, so the handler's next write fails instead of blocking forever.

use std::borrow::Cow;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::Response;
use hyper::body::Frame;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue};
use pin_project::{pin_project, pinned_drop};
use raffel_core::{Context, Envelope, EnvelopeKind, EnvelopeStream};
use tokio::time::{Instant, Sleep};

/// Render one envelope as an SSE frame, if it carries one.
fn frame_for(envelope: &Envelope) -> Option<String> {
    match envelope.kind {
        EnvelopeKind::StreamData => Some(format!("event: data\ndata: {}\n\n", envelope.payload)),
        EnvelopeKind::StreamError => {
            let error = envelope
                .payload
                .get("error")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            Some(format!("event: error\ndata: {error}\n\n"))
        }
        _ => None,
    }
}

/// Inserts comment frames when the inner stream stays pending too long.
#[pin_project]
struct KeepAlive<S> {
    #[pin]
    frames: S,
    comment: Cow<'static, str>,
    max_interval: Duration,
    #[pin]
    alive_timer: Sleep,
}

impl<S> KeepAlive<S> {
    fn new(frames: S, max_interval: Duration) -> Self {
        Self {
            frames,
            comment: Cow::Borrowed("ping"),
            max_interval,
            alive_timer: tokio::time::sleep(max_interval),
        }
    }
}

impl<S> Stream for KeepAlive<S>
where
    S: Stream<Item = String>,
{
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        match this.frames.poll_next(cx) {
            Poll::Pending => match this.alive_timer.as_mut().poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(()) => {
                    this.alive_timer.reset(Instant::now() + *this.max_interval);
                    Poll::Ready(Some(format!(": {}\n\n", this.comment)))
                }
            },
            Poll::Ready(Some(frame)) => {
                this.alive_timer.reset(Instant::now() + *this.max_interval);
                Poll::Ready(Some(frame))
            }
            Poll::Ready(None) => Poll::Ready(None),
        }
    }
}

/// Aborts the request context when the body is dropped.
///
/// A client disconnect drops the body mid-stream, which is the signal the
/// handler needs; after a completed stream the abort is an observer-free
/// no-op that merely releases anything still watching the context.
#[pin_project(PinnedDrop)]
struct AbortOnDrop<S> {
    #[pin]
    frames: S,
    ctx: Context,
}

impl<S> Stream for AbortOnDrop<S>
where
    S: Stream<Item = String>,
{
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.project().frames.poll_next(cx)
    }
}

#[pinned_drop]
impl<S> PinnedDrop for AbortOnDrop<S> {
    fn drop(self: Pin<&mut Self>) {
        self.ctx.abort();
    }
}

/// Build the `text/event-stream` response for a lifted stream.
pub(crate) fn response(
    stream: EnvelopeStream,
    ctx: Context,
    keep_alive: Option<Duration>,
) -> Response<crate::http::HttpBody> {
    let frames = stream.filter_map(|envelope| futures_util::future::ready(frame_for(&envelope)));
    let frames: BoxStream<'static, String> = match keep_alive {
        Some(interval) => KeepAlive::new(frames, interval).boxed(),
        None => frames.boxed(),
    };
    let guarded = AbortOnDrop { frames, ctx };
    let body = StreamBody::new(
        guarded.map(|frame| Ok::<_, Infallible>(Frame::data(Bytes::from(frame)))),
    );
    Response::builder()
        .status(hyper::StatusCode::OK)
        .header(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))
        .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .body(BodyExt::boxed_unsync(body))
        .unwrap_or_else(|_| Response::new(crate::http::empty_body()))
}
