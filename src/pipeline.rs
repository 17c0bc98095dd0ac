//! Wiring the stages together.
//!
//! A pipeline owns two workers and two conduits:
//!
//! ```text
//! raw tar ──▶ PathStripper ══conduit══▶ Compressor ══conduit══▶ PipelineStream (caller)
//! ```
//!
//! Both workers run as tasks on a [`JoinSet`] owned by the caller-facing [`PipelineStream`].
//! Failures travel forward through the conduits as terminal values.  Cancellation travels
//! backward: once a stage's output conduit has no reader the stage stops, drops its input, and
//! the stage before it sees the same thing.  Dropping the `JoinSet` aborts whatever is left.

use std::{
    future::poll_fn,
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::{Buf, Bytes};
use log::debug;
use tokio::{
    io::{AsyncRead, ReadBuf},
    task::JoinSet,
};

use crate::{
    compress::Compressor,
    conduit::ByteStream,
    error::{Result, StageError},
    strip::{PathStripper, StripDepth},
};

/// Where a pipeline is in its life.  `Completed` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Built, nothing read yet; no work has started.
    Idle,
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug)]
enum Inner<R> {
    Idle {
        input: R,
        depth: StripDepth,
    },
    Streaming {
        output: ByteStream,
        workers: JoinSet<()>,
    },
    Completed,
    Failed(StageError),
}

/// Builds a pipeline that re-streams the tar archive `raw` as gzip-compressed tar, with `depth`
/// leading path segments stripped from every entry name.
///
/// Nothing happens until the returned stream is first read.
///
/// # Panics
///
/// The first read spawns the stage workers, so it panics if it isn't made from within a tokio
/// runtime.  Building the stream doesn't need one.
pub fn build<R>(raw: R, depth: StripDepth) -> PipelineStream<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    PipelineStream {
        inner: Inner::Idle { input: raw, depth },
        chunk: Bytes::new(),
    }
}

/// The compressed output of a pipeline.
///
/// Read it with [`next_chunk()`](Self::next_chunk) or through `AsyncRead`.  Via `AsyncRead` a
/// failure arrives as an `io::Error`; [`StageError::from_io`] recovers it.
///
/// Dropping the stream before it completes cancels the pipeline.
#[derive(Debug)]
pub struct PipelineStream<R> {
    inner: Inner<R>,
    /// Unread remainder of a chunk partially handed out through `AsyncRead`.
    chunk: Bytes,
}

impl<R> PipelineStream<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn state(&self) -> PipelineState {
        match self.inner {
            Inner::Idle { .. } => PipelineState::Idle,
            Inner::Streaming { .. } => PipelineState::Streaming,
            Inner::Completed => PipelineState::Completed,
            Inner::Failed(_) => PipelineState::Failed,
        }
    }

    /// Stops the pipeline.  Every later read fails with [`StageError::Cancelled`].
    ///
    /// Does nothing once the pipeline has completed or failed.
    pub fn cancel(&mut self) {
        if matches!(self.inner, Inner::Idle { .. } | Inner::Streaming { .. }) {
            debug!("pipeline cancelled while {:?}", self.state());
            // drops the output conduit and aborts the workers
            self.inner = Inner::Failed(StageError::Cancelled);
            self.chunk.clear();
        }
    }

    /// Spawns the workers.
    fn start(&mut self) {
        let inner = std::mem::replace(&mut self.inner, Inner::Completed);
        self.inner = match inner {
            Inner::Idle { input, depth } => {
                debug!("starting pipeline, strip depth {depth}");
                let mut workers = JoinSet::new();
                let stripped = PathStripper::new(input, depth).spawn(&mut workers);
                let output = Compressor::new(stripped).spawn(&mut workers);
                Inner::Streaming { output, workers }
            }
            other => other,
        };
    }

    /// Polls for the next chunk of compressed output: `Ok(None)` at the clean end.
    ///
    /// The first call starts the pipeline, and panics when made outside a tokio runtime.
    pub fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Bytes>>> {
        if !self.chunk.is_empty() {
            return Poll::Ready(Ok(Some(std::mem::take(&mut self.chunk))));
        }

        loop {
            match &mut self.inner {
                Inner::Idle { .. } => self.start(),
                Inner::Streaming { output, .. } => {
                    let result = ready!(output.poll_chunk(cx));
                    match &result {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            debug!("pipeline complete");
                            self.inner = Inner::Completed;
                        }
                        Err(err) => {
                            debug!("pipeline failed: {err}");
                            self.inner = Inner::Failed(err.clone());
                        }
                    }
                    return Poll::Ready(result);
                }
                Inner::Completed => return Poll::Ready(Ok(None)),
                Inner::Failed(err) => return Poll::Ready(Err(err.clone())),
            }
        }
    }

    /// Waits for the next chunk of compressed output.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        poll_fn(|cx| self.poll_chunk(cx)).await
    }
}

/// Reading starts the pipeline like [`PipelineStream::poll_chunk`] does, so the first
/// `poll_read` has to happen within a tokio runtime.
impl<R> AsyncRead for PipelineStream<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut chunk = match ready!(this.poll_chunk(cx)) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Poll::Ready(Ok(())),
            Err(err) => return Poll::Ready(Err(err.into())),
        };

        let n = chunk.len().min(buf.remaining());
        buf.put_slice(&chunk[..n]);
        chunk.advance(n);
        this.chunk = chunk;
        Poll::Ready(Ok(()))
    }
}
