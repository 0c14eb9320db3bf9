//! The bounded, cancellable duplex stream every streaming path is built on.
//!
//! A [`RaffelStream`] is a single-producer/single-consumer async channel with
//! a configurable high-water mark. Writers get backpressure: once the buffer
//! is full, `write` suspends until a reader consumes. With a high-water mark
//! of zero the stream degenerates into a synchronous rendezvous where every
//! write waits for its matching read.
//!
//! The SSE writer, the per-socket WebSocket queue, the TCP write path and
//! the router's stream lifter all consume this primitive, so a stalled peer
//! suspends the producing handler at its next write.
//!
//! Terminal transitions (`end`, `error`, `cancel`) applied to an already
//! terminal stream are silent no-ops.
//!
//! ```
//! # use raffel_core::RaffelStream;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let stream = RaffelStream::new(4);
//! stream.write(1_u32).await.unwrap();
//! stream.end();
//! assert_eq!(stream.read().await.unwrap(), Some(1));
//! assert_eq!(stream.read().await.unwrap(), None);
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{ErrorKind, RpcError};

/// Default high-water mark for streams created by the runtime.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16;

/// Lifecycle of a [`RaffelStream`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StreamState {
    /// Accepting writes and reads.
    Open,
    /// `end()` was called; buffered values are still draining.
    Closing,
    /// Drained after `end()`; reads return the end marker.
    Closed,
    /// `error()` or `cancel()` fired; reads return the stored error.
    Errored,
}

impl StreamState {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

/// Construction options for [`RaffelStream::with_options`].
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Maximum buffered values before writes suspend.
    pub high_water_mark: usize,
    /// Correlation id; generated when empty.
    pub id: String,
    /// Scheduling hint for adapters multiplexing several streams.
    pub priority: u8,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            id: String::new(),
            priority: 0,
        }
    }
}

type ReadResult<T> = Result<Option<T>, RpcError>;

struct WaitingWriter<T> {
    value: T,
    done: oneshot::Sender<Result<(), RpcError>>,
}

struct Inner<T> {
    state: StreamState,
    paused: bool,
    hwm: usize,
    buffer: VecDeque<T>,
    readers: VecDeque<oneshot::Sender<ReadResult<T>>>,
    writers: VecDeque<WaitingWriter<T>>,
    error: Option<RpcError>,
}

impl<T> Inner<T> {
    /// Hand a value to the first parked reader still listening.
    /// Returns the value back if every parked reader has gone away.
    fn deliver(&mut self, mut value: T) -> Option<T> {
        while let Some(reader) = self.readers.pop_front() {
            match reader.send(Ok(Some(value))) {
                Ok(()) => return None,
                Err(Ok(Some(v))) => value = v,
                Err(_) => unreachable!("send returns the value it was given"),
            }
        }
        Some(value)
    }

    /// Move parked writers into buffer space freed by a read.
    fn refill(&mut self) {
        while self.buffer.len() < self.hwm {
            let Some(writer) = self.writers.pop_front() else {
                break;
            };
            self.buffer.push_back(writer.value);
            let _ = writer.done.send(Ok(()));
        }
    }

    /// Serve parked readers after a resume or state change.
    fn drain_readers(&mut self) {
        while !self.readers.is_empty() {
            if let Some(value) = self.buffer.pop_front() {
                if let Some(value) = self.deliver(value) {
                    self.buffer.push_front(value);
                    break;
                }
                self.refill();
            } else if let Some(writer) = self.writers.pop_front() {
                match self.deliver(writer.value) {
                    None => {
                        let _ = writer.done.send(Ok(()));
                    }
                    Some(value) => {
                        self.writers.push_front(WaitingWriter {
                            value,
                            done: writer.done,
                        });
                        break;
                    }
                }
            } else {
                match self.state {
                    StreamState::Closing | StreamState::Closed => {
                        self.state = StreamState::Closed;
                        for reader in self.readers.drain(..) {
                            let _ = reader.send(Ok(None));
                        }
                    }
                    StreamState::Errored => {
                        let err = self.stored_error();
                        for reader in self.readers.drain(..) {
                            let _ = reader.send(Err(err.clone()));
                        }
                    }
                    StreamState::Open => {}
                }
                break;
            }
        }
    }

    fn stored_error(&self) -> RpcError {
        self.error
            .clone()
            .unwrap_or_else(|| RpcError::cancelled(Some("stream cancelled")))
    }
}

struct Shared<T> {
    id: String,
    priority: u8,
    inner: Mutex<Inner<T>>,
}

/// A bounded, cancellable, pausable SPSC duplex channel.
///
/// The handle is a cheap clone; by convention one side writes and one side
/// reads. Concurrent writers or concurrent readers are not supported.
pub struct RaffelStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RaffelStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Debug for RaffelStream<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaffelStream")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("buffered", &self.buffered_amount())
            .finish()
    }
}

impl<T: Send + 'static> RaffelStream<T> {
    /// Create a stream with the given high-water mark.
    #[must_use]
    pub fn new(high_water_mark: usize) -> Self {
        Self::with_options(StreamOptions {
            high_water_mark,
            ..StreamOptions::default()
        })
    }

    /// Create a stream from explicit options.
    #[must_use]
    pub fn with_options(options: StreamOptions) -> Self {
        let id = if options.id.is_empty() {
            ulid::Ulid::new().to_string()
        } else {
            options.id
        };
        Self {
            shared: Arc::new(Shared {
                id,
                priority: options.priority,
                inner: Mutex::new(Inner {
                    state: StreamState::Open,
                    paused: false,
                    hwm: options.high_water_mark,
                    buffer: VecDeque::new(),
                    readers: VecDeque::new(),
                    writers: VecDeque::new(),
                    error: None,
                }),
            }),
        }
    }

    /// Stream id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Scheduling priority hint.
    #[must_use]
    pub fn priority(&self) -> u8 {
        self.shared.priority
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.shared.inner.lock().state
    }

    /// Number of buffered values (excludes parked writers).
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.shared.inner.lock().buffer.len()
    }

    /// Write one value.
    ///
    /// Resolves immediately on a direct handoff to a waiting reader or when
    /// buffer space is available; otherwise suspends until a reader consumes
    /// or the stream leaves `open`.
    pub async fn write(&self, value: T) -> Result<(), RpcError> {
        let waiter = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                StreamState::Open => {}
                StreamState::Closing | StreamState::Closed => {
                    return Err(RpcError::new(
                        ErrorKind::FailedPrecondition,
                        "write on an ended stream",
                    ));
                }
                StreamState::Errored => return Err(inner.stored_error()),
            }
            // FIFO: never overtake writers that are already parked.
            if inner.writers.is_empty() {
                if !inner.paused && inner.buffer.is_empty() && !inner.readers.is_empty() {
                    match inner.deliver(value) {
                        None => return Ok(()),
                        Some(value) => {
                            if inner.buffer.len() < inner.hwm {
                                inner.buffer.push_back(value);
                                return Ok(());
                            }
                            let (done, waiter) = oneshot::channel();
                            inner.writers.push_back(WaitingWriter { value, done });
                            waiter
                        }
                    }
                } else if inner.buffer.len() < inner.hwm {
                    inner.buffer.push_back(value);
                    return Ok(());
                } else {
                    let (done, waiter) = oneshot::channel();
                    inner.writers.push_back(WaitingWriter { value, done });
                    waiter
                }
            } else {
                let (done, waiter) = oneshot::channel();
                inner.writers.push_back(WaitingWriter { value, done });
                waiter
            }
        };
        match waiter.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::cancelled(Some("stream dropped"))),
        }
    }

    /// Read the next value.
    ///
    /// Returns `Ok(None)` once the stream has ended and drained, on this and
    /// every subsequent call. Returns the stored error once the stream has
    /// errored, on this and every subsequent call.
    pub async fn read(&self) -> ReadResult<T> {
        let waiter = {
            let mut inner = self.shared.inner.lock();
            let has_pending_values = !inner.buffer.is_empty()
                || !inner.writers.is_empty()
                || inner.state == StreamState::Open;
            if inner.paused && has_pending_values && inner.state != StreamState::Errored {
                let (tx, waiter) = oneshot::channel();
                inner.readers.push_back(tx);
                waiter
            } else if let Some(value) = inner.buffer.pop_front() {
                inner.refill();
                return Ok(Some(value));
            } else if let Some(writer) = inner.writers.pop_front() {
                let _ = writer.done.send(Ok(()));
                return Ok(Some(writer.value));
            } else {
                match inner.state {
                    StreamState::Closing | StreamState::Closed => {
                        inner.state = StreamState::Closed;
                        return Ok(None);
                    }
                    StreamState::Errored => return Err(inner.stored_error()),
                    StreamState::Open => {
                        let (tx, waiter) = oneshot::channel();
                        inner.readers.push_back(tx);
                        waiter
                    }
                }
            }
        };
        match waiter.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::cancelled(Some("stream dropped"))),
        }
    }

    /// Signal that no further values will be written.
    ///
    /// Buffered values remain readable; once drained, reads return the end
    /// marker. No-op after a terminal transition.
    pub fn end(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.state != StreamState::Open {
            return;
        }
        inner.state = StreamState::Closing;
        if !inner.paused {
            inner.drain_readers();
        }
        if inner.buffer.is_empty() && inner.writers.is_empty() && inner.readers.is_empty() {
            inner.state = StreamState::Closed;
        }
    }

    /// Terminate the stream with an error.
    ///
    /// Drops buffered values and rejects pending reads and writes. Silent
    /// no-op once the stream is already terminal.
    pub fn error(&self, error: RpcError) {
        let mut inner = self.shared.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = StreamState::Errored;
        inner.error = Some(error.clone());
        inner.buffer.clear();
        for reader in inner.readers.drain(..) {
            let _ = reader.send(Err(error.clone()));
        }
        for writer in inner.writers.drain(..) {
            let _ = writer.done.send(Err(error.clone()));
        }
    }

    /// Cancel the stream; shorthand for [`error`](Self::error) with
    /// `CANCELLED` and the given reason.
    pub fn cancel(&self, reason: Option<&str>) {
        self.error(RpcError::cancelled(reason.or(Some("stream cancelled"))));
    }

    /// Stop reads and direct handoffs from resolving.
    ///
    /// Writers may still fill the buffer up to the high-water mark.
    pub fn pause(&self) {
        self.shared.inner.lock().paused = true;
    }

    /// Undo [`pause`](Self::pause) and serve parked readers.
    pub fn resume(&self) {
        let mut inner = self.shared.inner.lock();
        if !inner.paused {
            return;
        }
        inner.paused = false;
        inner.drain_readers();
    }

    /// Whether the stream is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.inner.lock().paused
    }

    /// Iteration adapter.
    ///
    /// Yields `Ok(value)` per item and ends after the end marker or a single
    /// `Err`. Dropping the iterator before termination cancels the stream
    /// with reason `"stream consumer dropped"`.
    #[must_use]
    pub fn into_iter_stream(self) -> StreamIter<T> {
        StreamIter {
            stream: self,
            in_flight: None,
            done: false,
        }
    }
}

/// [`futures_util::Stream`] adapter over a [`RaffelStream`].
pub struct StreamIter<T: Send + 'static> {
    stream: RaffelStream<T>,
    in_flight: Option<BoxFuture<'static, ReadResult<T>>>,
    done: bool,
}

impl<T: Send + 'static> Debug for StreamIter<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamIter").field("done", &self.done).finish()
    }
}

impl<T: Send + 'static> futures_util::Stream for StreamIter<T> {
    type Item = Result<T, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let fut = this.in_flight.get_or_insert_with(|| {
            let stream = this.stream.clone();
            Box::pin(async move { stream.read().await })
        });
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.in_flight = None;
                match result {
                    Ok(Some(value)) => Poll::Ready(Some(Ok(value))),
                    Ok(None) => {
                        this.done = true;
                        Poll::Ready(None)
                    }
                    Err(e) => {
                        this.done = true;
                        Poll::Ready(Some(Err(e)))
                    }
                }
            }
        }
    }
}

impl<T: Send + 'static> Drop for StreamIter<T> {
    fn drop(&mut self) {
        if !self.done && !self.stream.shared.inner.lock().state.is_terminal() {
            self.stream.cancel(Some("stream consumer dropped"));
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_write_then_read_fifo() {
        let stream = RaffelStream::new(8);
        for i in 0..5_u32 {
            stream.write(i).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(stream.read().await.unwrap(), Some(i));
        }
    }

    #[tokio::test]
    async fn test_end_marker_repeats() {
        let stream = RaffelStream::new(2);
        stream.write(1_u32).await.unwrap();
        stream.end();
        assert_eq!(stream.state(), StreamState::Closing);
        assert_eq!(stream.read().await.unwrap(), Some(1));
        assert_eq!(stream.read().await.unwrap(), None);
        assert_eq!(stream.read().await.unwrap(), None);
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn test_error_rejects_current_and_future_reads() {
        let stream: RaffelStream<u32> = RaffelStream::new(2);
        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.read().await })
        };
        tokio::task::yield_now().await;
        stream.error(RpcError::new(ErrorKind::Unavailable, "boom"));
        let got = reader.await.unwrap().unwrap_err();
        assert_eq!(got.kind, ErrorKind::Unavailable);
        assert_eq!(stream.read().await.unwrap_err().kind, ErrorKind::Unavailable);
        assert_eq!(stream.state(), StreamState::Errored);
    }

    #[tokio::test]
    async fn test_backpressure_suspends_writer_at_hwm() {
        let stream = RaffelStream::new(2);
        stream.write(1_u32).await.unwrap();
        stream.write(2).await.unwrap();
        let blocked = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write(3).await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());
        assert_eq!(stream.buffered_amount(), 2);

        assert_eq!(stream.read().await.unwrap(), Some(1));
        blocked.await.unwrap().unwrap();
        assert_eq!(stream.buffered_amount(), 2);
    }

    #[tokio::test]
    async fn test_zero_hwm_rendezvous() {
        let stream = RaffelStream::new(0);
        let writers: Vec<_> = (0..4_u32)
            .map(|i| {
                let stream = stream.clone();
                tokio::spawn(async move { stream.write(i).await })
            })
            .collect();
        tokio::task::yield_now().await;
        // Pairwise FIFO: reads observe write order.
        for i in 0..4 {
            assert_eq!(stream.read().await.unwrap(), Some(i));
        }
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_direct_handoff_to_waiting_reader() {
        let stream = RaffelStream::new(0);
        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.read().await })
        };
        tokio::task::yield_now().await;
        stream.write(42_u32).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_pause_blocks_reads_until_resume() {
        let stream = RaffelStream::new(4);
        stream.write(7_u32).await.unwrap();
        stream.pause();
        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.read().await })
        };
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());
        // Writers may still buffer while paused.
        stream.write(8).await.unwrap();
        stream.resume();
        assert_eq!(reader.await.unwrap().unwrap(), Some(7));
        assert_eq!(stream.read().await.unwrap(), Some(8));
    }

    #[tokio::test]
    async fn test_cancel_rejects_pending_read() {
        let stream: RaffelStream<u32> = RaffelStream::new(0);
        let read = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.read().await })
        };
        tokio::task::yield_now().await;
        stream.cancel(Some("transport closed"));
        let err = read.await.unwrap().map(|_| ()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(err.message.contains("transport closed"));
        assert_eq!(stream.state(), StreamState::Errored);
    }

    #[tokio::test]
    async fn test_cancel_rejects_pending_write_and_drops_buffer() {
        let stream = RaffelStream::new(1);
        stream.write(1_u32).await.unwrap();
        let write = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write(2).await })
        };
        tokio::task::yield_now().await;
        stream.cancel(None);
        assert_eq!(write.await.unwrap().unwrap_err().kind, ErrorKind::Cancelled);
        assert_eq!(stream.buffered_amount(), 0);
        assert_eq!(stream.state(), StreamState::Errored);
    }

    #[tokio::test]
    async fn test_terminal_transitions_are_silent() {
        let stream: RaffelStream<u32> = RaffelStream::new(1);
        stream.cancel(None);
        // Already errored: these must all be no-ops.
        stream.end();
        stream.error(RpcError::new(ErrorKind::DataLoss, "late"));
        assert_eq!(stream.read().await.unwrap_err().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_write_after_end_fails() {
        let stream = RaffelStream::new(1);
        stream.write(1_u32).await.unwrap();
        stream.end();
        let err = stream.write(2).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_iteration_collects_in_order() {
        let stream = RaffelStream::new(2);
        let producer = {
            let stream = stream.clone();
            tokio::spawn(async move {
                for i in 0..10_u32 {
                    stream.write(i).await.unwrap();
                }
                stream.end();
            })
        };
        let values: Vec<u32> = stream
            .into_iter_stream()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(values, (0..10).collect::<Vec<_>>());
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_iterator_cancels() {
        let stream = RaffelStream::new(2);
        stream.write(1_u32).await.unwrap();
        let mut iter = stream.clone().into_iter_stream();
        assert_eq!(iter.next().await.unwrap().unwrap(), 1);
        drop(iter);
        assert_eq!(stream.state(), StreamState::Errored);
        let err = stream.write(2).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_hwm_never_exceeded() {
        let stream = RaffelStream::new(3);
        let writer = {
            let stream = stream.clone();
            tokio::spawn(async move {
                for i in 0..20_u32 {
                    stream.write(i).await.unwrap();
                }
                stream.end();
            })
        };
        let mut seen = Vec::new();
        loop {
            assert!(stream.buffered_amount() <= 3);
            match stream.read().await.unwrap() {
                Some(v) => seen.push(v),
                None => break,
            }
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        writer.await.unwrap();
    }
}
