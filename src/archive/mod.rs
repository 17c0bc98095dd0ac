//! Incremental tar archive handling.
//!
//! The `tar` crate's `Archive` wants to own a synchronous reader and walk the whole thing
//! itself, which doesn't fit a stage that must hand every chunk downstream as soon as it
//! arrives.  So we do the block-level work here, relying on `tar::Header` for the field layout
//! and on `tar::PaxExtensions` for PAX records:
//!
//! - [`ArchiveReader`] turns a raw byte stream into [`TarEntry`] values, folding GNU long
//!   name/link and PAX records into the entry they describe, and then yields the entry body in
//!   chunks.
//! - [`writer`] re-encodes an entry's header blocks under a new name, and produces the padding
//!   and end-of-archive blocks.

mod header;
mod reader;
pub mod writer;

use std::borrow::Cow;

use tar::{EntryType, Header};

pub use reader::{ArchiveReader, BODY_CHUNK_SIZE};

/// Size of a tar block; headers, and the padded bodies after them, are multiples of this.
pub const BLOCK_SIZE: u64 = 512;

/// Coarse classification of an entry's typeflag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    /// An archive-wide PAX record ('g').  Carries no file content.
    GlobalMetadata,
    /// Hard links, devices, fifos, contiguous files and anything unknown.
    Other,
}

impl From<EntryType> for EntryKind {
    fn from(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::Regular => EntryKind::Regular,
            EntryType::Directory => EntryKind::Directory,
            EntryType::Symlink => EntryKind::Symlink,
            EntryType::XGlobalHeader => EntryKind::GlobalMetadata,
            _ => EntryKind::Other,
        }
    }
}

/// A PAX local record set ('x') and the header block it arrived in.
#[derive(Debug, Clone)]
pub(crate) struct PaxRecords {
    pub(crate) header: Header,
    pub(crate) data: Vec<u8>,
}

/// One archive entry with every extension applied.
///
/// Besides the resolved fields this keeps the raw header block and the extension records that
/// preceded it, so the entry can be written back out with only its name changed.
#[derive(Debug, Clone)]
pub struct TarEntry {
    pub(crate) header: Header,
    pub(crate) path: Vec<u8>,
    pub(crate) link_target: Option<Vec<u8>>,
    pub(crate) kind: EntryKind,
    pub(crate) size: u64,
    pub(crate) mode: u32,
    pub(crate) mtime: u64,
    pub(crate) pax: Option<PaxRecords>,
    /// A GNU long link record, header and padded data, written back out verbatim.
    pub(crate) long_link: Option<Vec<u8>>,
}

impl TarEntry {
    /// The full path.  Priority: PAX `path` > GNU long name > ustar prefix + name.
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    /// The path as (lossy) UTF-8.
    pub fn name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.path)
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// The raw typeflag.
    pub fn entry_type(&self) -> EntryType {
        self.header.entry_type()
    }

    /// Number of body bytes following the header.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Modification time in whole seconds since the epoch.
    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    /// Target of a symlink or hard link.  Priority: PAX `linkpath` > GNU long link > header.
    pub fn link_target(&self) -> Option<&[u8]> {
        self.link_target.as_deref()
    }

    /// The entry's own header block, as read.
    pub fn header(&self) -> &Header {
        &self.header
    }
}
