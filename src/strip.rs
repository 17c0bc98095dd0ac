//! The path-stripping stage.
//!
//! Reads a raw tar stream entry by entry and re-emits it with the first `depth` path segments
//! removed from every entry name.  Archive-wide metadata records are dropped, and everything
//! else about an entry (typeflag, mode, size, times, link target, contents) passes through
//! untouched.

use std::{fmt, num::ParseIntError, str::FromStr};

use log::{debug, trace};
use tokio::{io::AsyncRead, task::JoinSet};

use crate::{
    archive::{
        writer::{encode_header, end_of_archive, padding},
        ArchiveReader, EntryKind,
    },
    conduit::{conduit, ByteStream, ConduitWriter, CONDUIT_CAPACITY},
    error::{Result, StageError},
};

/// The number of leading path segments removed from every entry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StripDepth(usize);

impl StripDepth {
    pub const fn new(depth: usize) -> Self {
        Self(depth)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

/// Source-control archives put everything under a single top-level directory.
impl Default for StripDepth {
    fn default() -> Self {
        Self(1)
    }
}

impl From<usize> for StripDepth {
    fn from(depth: usize) -> Self {
        Self(depth)
    }
}

impl FromStr for StripDepth {
    type Err = ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for StripDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Removes the first `depth` `/`-separated segments of `path`.
///
/// Returns `None` if `path` doesn't have more than `depth` segments.  Otherwise returns the
/// remainder with any leading separators trimmed, which is empty when `path` names one of the
/// stripped directories itself (like `repo/` at depth 1).
///
/// No other normalization is done: empty and `..` segments count like any other.
pub fn strip_components(path: &[u8], depth: usize) -> Option<&[u8]> {
    let mut segments = path.splitn(depth.saturating_add(1), |&c| c == b'/');
    let rest = segments.nth(depth)?;
    let skip = rest.iter().take_while(|&&c| c == b'/').count();
    Some(&rest[skip..])
}

/// Streams an archive with `depth` leading path segments removed from each entry name.
#[derive(Debug)]
pub struct PathStripper<R> {
    reader: ArchiveReader<R>,
    depth: StripDepth,
}

impl<R: AsyncRead + Unpin + Send + 'static> PathStripper<R> {
    pub fn new(input: R, depth: StripDepth) -> Self {
        Self {
            reader: ArchiveReader::new(input),
            depth,
        }
    }

    /// Starts the stage on `workers`, returning the stream of the rewritten archive.
    pub fn spawn(self, workers: &mut JoinSet<()>) -> ByteStream {
        let (output, stream) = conduit(CONDUIT_CAPACITY);
        workers.spawn(self.run(output));
        stream
    }

    /// Runs the stage to completion, terminating `output` with a clean end or the first error.
    ///
    /// Stops as soon as the reader of `output` goes away, even while waiting for input.
    pub async fn run(mut self, mut output: ConduitWriter) {
        let cancelled = output.cancellation();
        let result = tokio::select! {
            result = self.transform(&mut output) => result,
            () = cancelled => Err(StageError::Cancelled),
        };

        match result {
            Ok(()) => output.finish().await,
            Err(err) => {
                debug!("path stripping stopped: {err}");
                output.fail(err).await;
            }
        }
    }

    async fn transform(&mut self, output: &mut ConduitWriter) -> Result<()> {
        let depth = self.depth.get();
        let mut emitted = 0usize;

        while let Some(entry) = self.reader.next_entry().await? {
            if entry.kind() == EntryKind::GlobalMetadata {
                // its body gets skipped by the next next_entry()
                debug!("dropping global metadata entry {:?}", entry.name());
                continue;
            }

            let Some(stripped) = strip_components(entry.path(), depth) else {
                return Err(StageError::InsufficientDepth {
                    name: entry.name().into_owned(),
                    depth,
                });
            };

            if stripped.is_empty() {
                trace!("dropping stripped directory {:?}", entry.name());
                continue;
            }

            trace!(
                "{:?} -> {:?}",
                entry.name(),
                String::from_utf8_lossy(stripped)
            );
            let header = encode_header(&entry, stripped).map_err(|err| err.at(&entry.name()))?;
            output.write(header).await?;

            // read_body() hands out exactly entry.size() bytes or fails as truncated
            while let Some(chunk) = self
                .reader
                .read_body()
                .await
                .map_err(|err| err.at(&entry.name()))?
            {
                output.write(chunk).await?;
            }
            output.write(padding(entry.size())).await?;
            emitted += 1;
        }

        output.write(end_of_archive()).await?;
        debug!("stripped {depth} segments from {emitted} entries");
        Ok(())
    }
}
