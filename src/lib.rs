//! Re-streams source-control tar archives as flat, gzip-compressed module packages.
//!
//! Archives produced by source-control hosts put every file under a top-level directory named
//! after the project and revision.  Package clients want the files at the root.  The
//! [`pipeline`] fixes that on the fly: a [`strip::PathStripper`] removes leading path segments
//! from every entry and a [`compress::Compressor`] gzips the result, each running as its own
//! task, so an archive of any size is re-streamed in constant memory while it's still being
//! fetched.

pub mod archive;
pub mod compress;
pub mod conduit;
pub mod error;
pub mod module;
pub mod pipeline;
pub mod strip;
mod util;


pub use error::StageError;
pub use pipeline::{build, PipelineState, PipelineStream};
pub use strip::StripDepth;
