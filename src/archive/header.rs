//! Raw header block checks and edits.

use tar::{EntryType, Header};

use crate::error::{Result, StageError};

/// Capacity of the `name` field of a header block.
pub(crate) const NAME_FIELD_LEN: usize = 100;

// byte offsets inside the 512-byte header block
const CKSUM_RANGE: std::ops::Range<usize> = 148..156;
const MAGIC_RANGE: std::ops::Range<usize> = 257..265;

/// Checks the header checksum and magic.
///
/// The checksum is the sum of every byte in the block, with the checksum field itself counted
/// as spaces.  Some old writers summed the bytes as signed chars, so that sum is accepted too.
/// Accepted magics are ustar, GNU, and the all-zero magic of v7 archives.
pub(crate) fn verify(header: &Header) -> Result<()> {
    let stored = header
        .cksum()
        .map_err(|err| StageError::malformed(format!("unparsable header checksum: {err}")))?;

    let bytes = header.as_bytes();
    let (unsigned, signed) = bytes
        .iter()
        .enumerate()
        .map(|(i, &byte)| match CKSUM_RANGE.contains(&i) {
            true => b' ',
            false => byte,
        })
        .fold((0i64, 0i64), |(unsigned, signed), byte| {
            (unsigned + i64::from(byte), signed + i64::from(byte as i8))
        });

    let stored = i64::from(stored);
    if stored != unsigned && stored != signed {
        return Err(StageError::malformed(format!(
            "header checksum mismatch: stored {stored}, computed {unsigned}"
        )));
    }

    let v7 = bytes[MAGIC_RANGE].iter().all(|&b| b == 0);
    if !v7 && header.as_ustar().is_none() && header.as_gnu().is_none() {
        return Err(StageError::malformed("unrecognized header magic"));
    }

    Ok(())
}

/// Writes `path` into the name field (truncating it if it doesn't fit), clears the ustar prefix
/// so the two can't be recombined by a reader, and refreshes the checksum.
pub(crate) fn set_name(header: &mut Header, path: &[u8]) {
    let name = &mut header.as_old_mut().name;
    let len = path.len().min(NAME_FIELD_LEN);
    name.fill(0);
    name[..len].copy_from_slice(&path[..len]);

    if let Some(ustar) = header.as_ustar_mut() {
        ustar.prefix.fill(0);
    }

    header.set_cksum();
}

/// Builds the header of a GNU long name record carrying `data_len` bytes.
pub(crate) fn gnu_long_name(data_len: u64) -> Header {
    const LONG_LINK_NAME: &[u8] = b"././@LongLink";

    let mut header = Header::new_gnu();
    header.as_old_mut().name[..LONG_LINK_NAME.len()].copy_from_slice(LONG_LINK_NAME);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(data_len);
    header.set_entry_type(EntryType::GNULongName);
    header.set_cksum();
    header
}
