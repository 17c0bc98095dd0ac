//! Failure taxonomy shared by every stage of the re-streaming pipeline.
//!
//! A [`StageError`] is a plain value: stages hand it to their output conduit as the terminal
//! message instead of closing it, so the next stage sees the failure rather than an ordinary
//! end-of-stream.  It is `Clone` because a failed stream keeps answering every later read with
//! the same error.

use std::{io, sync::Arc};

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, StageError>;

/// The ways a pipeline stage can fail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    /// An entry's path has `depth` or fewer segments, so there's nothing left after stripping.
    #[error("can't strip {depth} elements from '{name}'")]
    InsufficientDepth {
        /// The full entry name, as found in the input archive.
        name: String,
        /// The requested strip depth.
        depth: usize,
    },

    /// The input is not a well-formed tar stream.
    #[error("malformed archive{}: {source}", at_entry(.entry))]
    MalformedArchive {
        /// The entry being read when the fault was found, if any.
        entry: Option<String>,
        #[source]
        source: Arc<io::Error>,
    },

    /// The fetched byte stream itself failed mid-read.
    #[error("upstream read failed{}: {source}", at_entry(.entry))]
    UpstreamIo {
        /// The entry being read when the fetch failed, if any.
        entry: Option<String>,
        #[source]
        source: Arc<io::Error>,
    },

    /// The compressor could not produce or finalize its output.
    #[error("compression failed: {source}")]
    CompressionFailure {
        #[source]
        source: Arc<io::Error>,
    },

    /// The consumer went away before the stream completed.
    #[error("stream cancelled")]
    Cancelled,
}

fn at_entry(entry: &Option<String>) -> String {
    match entry {
        Some(name) => format!(" at '{name}'"),
        None => String::new(),
    }
}

impl StageError {
    /// A structural fault in the archive, described by `reason`.
    pub fn malformed(reason: impl Into<String>) -> Self {
        StageError::MalformedArchive {
            entry: None,
            source: Arc::new(io::Error::new(io::ErrorKind::InvalidData, reason.into())),
        }
    }

    /// Input ended in the middle of a block, a body, or its padding.
    pub fn truncated() -> Self {
        StageError::MalformedArchive {
            entry: None,
            source: Arc::new(io::ErrorKind::UnexpectedEof.into()),
        }
    }

    /// Classifies an error returned by the reader underneath the archive parser.
    ///
    /// Our own truncation checks report `UnexpectedEof`, so anything of that kind is a malformed
    /// archive; everything else came from the fetch itself.
    pub fn from_upstream(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            StageError::MalformedArchive {
                entry: None,
                source: Arc::new(err),
            }
        } else {
            StageError::UpstreamIo {
                entry: None,
                source: Arc::new(err),
            }
        }
    }

    pub fn compression(err: io::Error) -> Self {
        StageError::CompressionFailure {
            source: Arc::new(err),
        }
    }

    /// Attaches the name of the entry being processed, unless one is already recorded.
    pub fn at(self, name: &str) -> Self {
        match self {
            StageError::MalformedArchive {
                entry: None,
                source,
            } => StageError::MalformedArchive {
                entry: Some(name.to_string()),
                source,
            },
            StageError::UpstreamIo {
                entry: None,
                source,
            } => StageError::UpstreamIo {
                entry: Some(name.to_string()),
                source,
            },
            other => other,
        }
    }

    /// Recovers the stage error carried inside an `io::Error` produced by one of our readers.
    pub fn from_io(err: &io::Error) -> Option<&StageError> {
        err.get_ref()?.downcast_ref::<StageError>()
    }

    /// Whether this is the cancellation of the stream rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled)
    }
}

impl From<StageError> for io::Error {
    fn from(err: StageError) -> Self {
        io::Error::other(err)
    }
}
