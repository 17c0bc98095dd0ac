//! Bounded, single-producer/single-consumer byte conduits between pipeline stages.
//!
//! Every message on a conduit is either a chunk of data or one of the two terminal values: a
//! clean end or a failure.  A writer that goes away without sending a terminal value (its task
//! was aborted, or it panicked) is read as [`StageError::Cancelled`], never as end-of-stream, so
//! a consumer can't mistake a dead producer for a complete one.

use std::{
    future::{poll_fn, Future},
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::{Buf, Bytes};
use tokio::{
    io::{AsyncBufRead, AsyncRead, ReadBuf},
    sync::mpsc,
};

use crate::error::{Result, StageError};

/// Number of in-flight messages a conduit holds before its writer blocks.
pub const CONDUIT_CAPACITY: usize = 8;

#[derive(Debug)]
enum Message {
    Data(Bytes),
    Failed(StageError),
    End,
}

/// Creates a connected writer/reader pair holding at most `capacity` unread messages.
pub fn conduit(capacity: usize) -> (ConduitWriter, ByteStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ConduitWriter { tx },
        ByteStream {
            rx,
            chunk: Bytes::new(),
            terminal: None,
        },
    )
}

/// The producing half of a conduit.
///
/// `finish()` and `fail()` consume the writer, so at most one terminal value is ever sent.
#[derive(Debug)]
pub struct ConduitWriter {
    tx: mpsc::Sender<Message>,
}

impl ConduitWriter {
    /// Sends a chunk, waiting while the conduit is full.
    ///
    /// Fails with [`StageError::Cancelled`] once the reading half has been dropped; the caller
    /// is expected to stop all work at that point.
    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Message::Data(data))
            .await
            .map_err(|_| StageError::Cancelled)
    }

    /// Marks the stream as cleanly complete.
    pub async fn finish(self) {
        // a closed conduit has nobody left to tell
        let _ = self.tx.send(Message::End).await;
    }

    /// Marks the stream as failed with `err`.
    pub async fn fail(self, err: StageError) {
        let _ = self.tx.send(Message::Failed(err)).await;
    }

    /// Whether the reading half is gone.
    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// A future that resolves once the reading half has been dropped.
    ///
    /// It doesn't borrow the writer, so a stage can race it against work that uses the writer.
    pub fn cancellation(&self) -> impl Future<Output = ()> + Send + 'static {
        let tx = self.tx.clone();
        async move { tx.closed().await }
    }
}

#[derive(Debug, Clone)]
enum Terminal {
    End,
    Failed(StageError),
}

/// The consuming half of a conduit: an ordered, single-pass stream of byte chunks.
///
/// Besides [`next_chunk()`](Self::next_chunk) this implements `AsyncRead` and `AsyncBufRead`.
/// Through those traits a failure shows up as an `io::Error` wrapping the [`StageError`]; use
/// [`failure()`](Self::failure) or [`StageError::from_io`] to get it back.
#[derive(Debug)]
pub struct ByteStream {
    rx: mpsc::Receiver<Message>,
    chunk: Bytes,
    terminal: Option<Terminal>,
}

impl ByteStream {
    /// Polls for the next chunk: `Ok(None)` on clean end, the stored error once failed.
    pub fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Bytes>>> {
        if !self.chunk.is_empty() {
            return Poll::Ready(Ok(Some(std::mem::take(&mut self.chunk))));
        }

        if let Some(terminal) = &self.terminal {
            return Poll::Ready(match terminal {
                Terminal::End => Ok(None),
                Terminal::Failed(err) => Err(err.clone()),
            });
        }

        let terminal = match ready!(self.rx.poll_recv(cx)) {
            Some(Message::Data(data)) => return Poll::Ready(Ok(Some(data))),
            Some(Message::End) => Terminal::End,
            Some(Message::Failed(err)) => Terminal::Failed(err),
            None => Terminal::Failed(StageError::Cancelled),
        };

        // nothing may follow a terminal value; let the writer notice if it tries
        self.rx.close();
        self.terminal = Some(terminal);
        self.poll_chunk(cx)
    }

    /// Waits for the next chunk.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        poll_fn(|cx| self.poll_chunk(cx)).await
    }

    /// Reads the whole stream into memory.  Meant for tests and small archives.
    pub async fn collect(mut self) -> Result<Vec<u8>> {
        let mut data = vec![];
        while let Some(chunk) = self.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// The failure this stream terminated with, if it has.
    pub fn failure(&self) -> Option<&StageError> {
        match &self.terminal {
            Some(Terminal::Failed(err)) => Some(err),
            _ => None,
        }
    }

    /// Whether the stream has reached its clean end.
    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        matches!(self.terminal, Some(Terminal::End)) && self.chunk.is_empty()
    }
}

impl AsyncBufRead for ByteStream {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        if this.chunk.is_empty() {
            match ready!(this.poll_chunk(cx)) {
                Ok(Some(chunk)) => this.chunk = chunk,
                Ok(None) => {}
                Err(err) => return Poll::Ready(Err(err.into())),
            }
        }
        Poll::Ready(Ok(&this.chunk[..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.get_mut().chunk.advance(amt);
    }
}

impl AsyncRead for ByteStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let available = ready!(self.as_mut().poll_fill_buf(cx))?;
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        self.consume(n);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn test_data_then_end() {
        let (mut writer, mut reader) = conduit(4);
        writer.write(Bytes::from_static(b"hello ")).await.unwrap();
        writer.write(Bytes::new()).await.unwrap(); // dropped, not a terminal
        writer.write(Bytes::from_static(b"world")).await.unwrap();
        writer.finish().await;

        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "hello world");
        assert!(reader.is_complete());

        // repeatable
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_is_sticky() {
        let (mut writer, mut reader) = conduit(4);
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        writer.fail(StageError::malformed("bad header")).await;

        assert_eq!(
            reader.next_chunk().await.unwrap().as_deref(),
            Some(&b"partial"[..])
        );
        for _ in 0..2 {
            let err = reader.next_chunk().await.unwrap_err();
            assert!(matches!(err, StageError::MalformedArchive { .. }));
        }
        assert!(reader.failure().is_some());
        assert!(!reader.is_complete());
    }

    #[tokio::test]
    async fn test_failure_through_async_read() {
        let (writer, mut reader) = conduit(4);
        writer.fail(StageError::Cancelled).await;

        let err = reader.read_to_end(&mut vec![]).await.unwrap_err();
        assert!(StageError::from_io(&err).unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_writer_is_not_end() {
        let (mut writer, mut reader) = conduit(4);
        writer.write(Bytes::from_static(b"abc")).await.unwrap();
        drop(writer);

        assert!(reader.next_chunk().await.unwrap().is_some());
        assert!(reader.next_chunk().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_reader_cancels_writer() {
        let (mut writer, reader) = conduit(1);
        drop(reader);

        assert!(writer.is_closed());
        writer.cancellation().await;
        let err = writer.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_backpressure() {
        let (mut writer, mut reader) = conduit(1);
        writer.write(Bytes::from_static(b"1")).await.unwrap();

        // the second write can't complete until the reader makes room
        let mut second = tokio_test::task::spawn(writer.write(Bytes::from_static(b"2")));
        assert!(second.poll().is_pending());

        assert_eq!(
            reader.next_chunk().await.unwrap().as_deref(),
            Some(&b"1"[..])
        );
        assert!(second.is_woken());
        assert!(second.poll().is_ready());
    }
}
