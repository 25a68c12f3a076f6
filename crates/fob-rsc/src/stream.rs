//! Byte streams and stream duplication.
//!
//! Every body in the protocol is a [`ByteStream`]. [`tee`] splits one stream
//! into two readers backed by a shared buffer: the reader that is ahead pulls
//! from the source and queues each chunk for the other. A reader may run at
//! most `limit` bytes ahead of the other before it is held back, and dropping a
//! reader releases its queue so an abandoned copy never pins memory.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Boxed stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Stream yielding `text` as a single chunk.
pub fn string_to_stream(text: impl Into<String>) -> ByteStream {
    let bytes = Bytes::from(text.into());
    Box::pin(stream::once(async move { Ok::<_, io::Error>(bytes) }))
}

/// Stream yielding the given chunks in order.
pub fn chunks_to_stream<I>(chunks: I) -> ByteStream
where
    I: IntoIterator<Item = Bytes>,
    I::IntoIter: Send + 'static,
{
    Box::pin(stream::iter(chunks.into_iter().map(Ok::<Bytes, io::Error>)))
}

/// Stream with no chunks.
pub fn empty_stream() -> ByteStream {
    Box::pin(stream::empty::<io::Result<Bytes>>())
}

/// Drain a stream into one buffer.
pub async fn collect_bytes(mut body: ByteStream) -> io::Result<Bytes> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(buf))
}

/// Drain a stream into a UTF-8 string.
pub async fn collect_string(body: ByteStream) -> io::Result<String> {
    let bytes = collect_bytes(body).await?;
    String::from_utf8(bytes.to_vec()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

type Queued = Result<Bytes, String>;

struct TeeShared {
    source: ByteStream,
    queues: [VecDeque<Queued>; 2],
    queued_bytes: [usize; 2],
    open: [bool; 2],
    wakers: [Option<Waker>; 2],
    finished: bool,
    limit: usize,
}

impl TeeShared {
    fn push(&mut self, reader: usize, item: Queued) {
        if !self.open[reader] {
            return;
        }
        if let Ok(chunk) = &item {
            self.queued_bytes[reader] += chunk.len();
        }
        self.queues[reader].push_back(item);
        self.wake(reader);
    }

    fn pop(&mut self, reader: usize) -> Option<Queued> {
        let item = self.queues[reader].pop_front()?;
        if let Ok(chunk) = &item {
            self.queued_bytes[reader] -= chunk.len();
        }
        // the other reader may be parked on our lag
        self.wake(1 - reader);
        Some(item)
    }

    fn wake(&mut self, reader: usize) {
        if let Some(waker) = self.wakers[reader].take() {
            waker.wake();
        }
    }
}

/// One of the two readers returned by [`tee`].
pub struct TeeStream {
    shared: Arc<Mutex<TeeShared>>,
    index: usize,
}

/// Duplicate `source` into two independently consumable streams.
///
/// Both copies yield every chunk of the source in order, whichever is read
/// first. `limit` caps how many bytes one reader may buffer on behalf of the
/// other; when the cap is hit the leading reader waits until the lagging one
/// catches up or is dropped.
pub fn tee(source: ByteStream, limit: usize) -> (TeeStream, TeeStream) {
    let shared = Arc::new(Mutex::new(TeeShared {
        source,
        queues: [VecDeque::new(), VecDeque::new()],
        queued_bytes: [0, 0],
        open: [true, true],
        wakers: [None, None],
        finished: false,
        limit: limit.max(1),
    }));
    (
        TeeStream {
            shared: Arc::clone(&shared),
            index: 0,
        },
        TeeStream { shared, index: 1 },
    )
}

impl TeeStream {
    /// Bytes currently buffered for this reader.
    pub fn buffered_bytes(&self) -> usize {
        self.shared.lock().queued_bytes[self.index]
    }

    pub fn boxed(self) -> ByteStream {
        Box::pin(self)
    }
}

impl Stream for TeeStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.index;
        let other = 1 - me;
        let mut shared = self.shared.lock();

        if let Some(item) = shared.pop(me) {
            return Poll::Ready(Some(item.map_err(io::Error::other)));
        }
        if shared.finished {
            return Poll::Ready(None);
        }
        if shared.open[other] && shared.queued_bytes[other] >= shared.limit {
            shared.wakers[me] = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let polled = shared.source.as_mut().poll_next(cx);
        match polled {
            Poll::Ready(Some(Ok(chunk))) => {
                shared.push(other, Ok(chunk.clone()));
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                let message = err.to_string();
                shared.push(other, Err(message));
                shared.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                shared.finished = true;
                shared.wake(other);
                Poll::Ready(None)
            }
            Poll::Pending => {
                // the source only keeps the last waker it saw
                shared.wakers[me] = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for TeeStream {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        let me = self.index;
        shared.open[me] = false;
        shared.queues[me].clear();
        shared.queued_bytes[me] = 0;
        shared.wakers[me] = None;
        shared.wake(1 - me);
    }
}
