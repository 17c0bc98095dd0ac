//! Pull-based reader producing one [`TarEntry`] at a time from a raw byte stream.

use std::str;

use bytes::Bytes;
use log::trace;
use tar::{EntryType, Header, PaxExtensions};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::{header, EntryKind, PaxRecords, TarEntry, BLOCK_SIZE};
use crate::{
    error::{Result, StageError},
    util::{read_exactish, skip_exact},
};

/// Largest body chunk handed out by [`ArchiveReader::read_body`].
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

// A GNU long name/link record should only hold one path.
const MAX_GNU_LONG_SIZE: u64 = 64 * 1024;
const MAX_PAX_SIZE: u64 = 1024 * 1024;
// metadata records allowed in a row before a real entry must show up
const MAX_PENDING_RECORDS: usize = 16;

/// Metadata records waiting for the entry they apply to.
#[derive(Debug, Default)]
struct Pending {
    long_name: Option<Vec<u8>>,
    long_link: Option<(Vec<u8>, Vec<u8>)>,
    pax: Option<PaxRecords>,
    count: usize,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.long_name.is_none() && self.long_link.is_none() && self.pax.is_none()
    }
}

/// Reads a tar stream entry by entry, strictly in order.
///
/// After [`next_entry()`](Self::next_entry) returns an entry, its body can be consumed with
/// [`read_body()`](Self::read_body) or [`skip_body()`](Self::skip_body); any part left unread
/// is skipped by the next call to `next_entry()`.
///
/// Errors returned by the underlying reader are reported as [`StageError::UpstreamIo`];
/// everything wrong with the archive itself, truncation included, is
/// [`StageError::MalformedArchive`].
#[derive(Debug)]
pub struct ArchiveReader<R> {
    reader: BufReader<R>,
    /// Body bytes of the current entry not yet handed out.
    remaining: u64,
    /// Padding after the current entry's body.
    padding: u64,
    done: bool,
}

impl<R: AsyncRead + Unpin> ArchiveReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(BODY_CHUNK_SIZE, reader),
            remaining: 0,
            padding: 0,
            done: false,
        }
    }

    /// Returns the next entry, or `None` at the end of the archive.
    ///
    /// The archive ends at two all-zero blocks.  A single zero block is accepted only when the
    /// input ends right after it; one followed by anything but a second zero block is a
    /// [`StageError::MalformedArchive`].
    ///
    /// Input that stops cleanly on a block boundary with no end marker at all is also taken as
    /// the end of the archive, the way common tar readers treat it.  A stream cut short inside
    /// a header or body is still reported as malformed.
    pub async fn next_entry(&mut self) -> Result<Option<TarEntry>> {
        self.skip_body().await?;
        if self.done {
            return Ok(None);
        }

        let mut pending = Pending::default();
        loop {
            if pending.count > MAX_PENDING_RECORDS {
                return Err(StageError::malformed(format!(
                    "more than {MAX_PENDING_RECORDS} metadata records in a row"
                )));
            }

            let mut header = Header::new_old();
            let got_header = read_exactish(&mut self.reader, header.as_mut_bytes())
                .await
                .map_err(StageError::from_upstream)?;

            if !got_header || header.as_bytes() == &[0u8; 512] {
                self.done = true;
                if got_header {
                    self.second_zero_block().await?;
                }
                if !pending.is_empty() {
                    return Err(StageError::malformed(
                        "metadata records without a following entry",
                    ));
                }
                return Ok(None);
            }

            header::verify(&header)?;
            let size = header
                .entry_size()
                .map_err(|err| StageError::malformed(format!("invalid entry size: {err}")))?;
            let padded = padded_size(size)?;

            match header.entry_type() {
                EntryType::GNULongName => {
                    let mut data = self.read_record(size, padded, MAX_GNU_LONG_SIZE).await?;
                    trim_nul(&mut data);
                    pending.long_name = Some(data);
                }
                EntryType::GNULongLink => {
                    let data = self.read_record(size, padded, MAX_GNU_LONG_SIZE).await?;
                    let mut raw = header.as_bytes().to_vec();
                    raw.extend_from_slice(&data);
                    raw.resize(raw.len() + (padded - size) as usize, 0);

                    let mut target = data;
                    trim_nul(&mut target);
                    pending.long_link = Some((raw, target));
                }
                EntryType::XHeader => {
                    let data = self.read_record(size, padded, MAX_PAX_SIZE).await?;
                    pending.pax = Some(PaxRecords { header, data });
                }
                _ => {
                    let entry = resolve(header, pending)?;
                    trace!(
                        "entry {:?} ({:?}, {} bytes)",
                        entry.name(),
                        entry.kind,
                        entry.size
                    );
                    self.remaining = entry.size;
                    self.padding = padded_size(entry.size)? - entry.size;
                    return Ok(Some(entry));
                }
            }
            pending.count += 1;
        }
    }

    /// Returns the next chunk of the current entry's body, or `None` once it is exhausted.
    ///
    /// Chunks are never larger than [`BODY_CHUNK_SIZE`].  The padding after the body is consumed
    /// along with its last chunk.
    pub async fn read_body(&mut self) -> Result<Option<Bytes>> {
        if self.remaining == 0 {
            self.skip_padding().await?;
            return Ok(None);
        }

        let available = self
            .reader
            .fill_buf()
            .await
            .map_err(StageError::from_upstream)?;
        if available.is_empty() {
            return Err(StageError::truncated());
        }

        let len = available
            .len()
            .min(BODY_CHUNK_SIZE)
            .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let chunk = Bytes::copy_from_slice(&available[..len]);
        self.reader.consume(len);
        self.remaining -= len as u64;

        if self.remaining == 0 {
            self.skip_padding().await?;
        }
        Ok(Some(chunk))
    }

    /// Discards whatever is left of the current entry's body and padding.
    pub async fn skip_body(&mut self) -> Result<()> {
        let len = self.remaining + self.padding;
        self.remaining = 0;
        self.padding = 0;
        skip_exact(&mut self.reader, len)
            .await
            .map_err(StageError::from_upstream)
    }

    async fn skip_padding(&mut self) -> Result<()> {
        let len = std::mem::take(&mut self.padding);
        skip_exact(&mut self.reader, len)
            .await
            .map_err(StageError::from_upstream)
    }

    /// Checks what follows the first zero block of the end marker.  Only a second zero block or
    /// the end of the input may; a lone zero block means entries would go missing.
    async fn second_zero_block(&mut self) -> Result<()> {
        let mut block = [0u8; BLOCK_SIZE as usize];
        let got_block = read_exactish(&mut self.reader, &mut block)
            .await
            .map_err(StageError::from_upstream)?;
        if got_block && block.iter().any(|&b| b != 0) {
            return Err(StageError::malformed(
                "zero block followed by a non-zero block",
            ));
        }
        Ok(())
    }

    /// Reads the body of a metadata record, which is small enough to hold in memory.
    async fn read_record(&mut self, size: u64, padded: u64, limit: u64) -> Result<Vec<u8>> {
        if size > limit {
            return Err(StageError::malformed(format!(
                "metadata record of {size} bytes exceeds the {limit} byte limit"
            )));
        }

        let mut data = vec![0u8; size as usize];
        if !read_exactish(&mut self.reader, &mut data)
            .await
            .map_err(StageError::from_upstream)?
            && size > 0
        {
            return Err(StageError::truncated());
        }
        skip_exact(&mut self.reader, padded - size)
            .await
            .map_err(StageError::from_upstream)?;
        Ok(data)
    }
}

fn padded_size(size: u64) -> Result<u64> {
    size.checked_next_multiple_of(BLOCK_SIZE)
        .ok_or_else(|| StageError::malformed(format!("entry size {size} overflows")))
}

fn trim_nul(data: &mut Vec<u8>) {
    while data.last() == Some(&0) {
        data.pop();
    }
}

/// Folds the pending metadata records into the header they precede.
fn resolve(header: Header, pending: Pending) -> Result<TarEntry> {
    let name_for_errors = String::from_utf8_lossy(&header.path_bytes()).into_owned();
    let malformed = |err: std::io::Error| {
        StageError::malformed(format!("invalid header field: {err}")).at(&name_for_errors)
    };

    let mut path = pending
        .long_name
        .unwrap_or_else(|| header.path_bytes().into_owned());
    let mut link_target = match pending.long_link {
        Some((_, ref target)) => Some(target.clone()),
        None => header.link_name_bytes().map(|name| name.into_owned()),
    };
    let mut size = header.entry_size().map_err(malformed)?;
    let mode = header.mode().map_err(malformed)?;
    let mut mtime = header.mtime().map_err(malformed)?;

    if let Some(pax) = &pending.pax {
        for extension in PaxExtensions::new(&pax.data) {
            let extension = extension.map_err(malformed)?;
            let key = extension.key().map_err(|err| {
                StageError::malformed(format!("invalid PAX key: {err}")).at(&name_for_errors)
            })?;
            let value = extension.value_bytes();

            match key {
                "path" => path = value.to_vec(),
                "linkpath" => link_target = Some(value.to_vec()),
                "size" => size = pax_number(key, value).map_err(|e| e.at(&name_for_errors))?,
                "mtime" => mtime = pax_number(key, value).map_err(|e| e.at(&name_for_errors))?,
                _ => {}
            }
        }
    }

    Ok(TarEntry {
        kind: EntryKind::from(header.entry_type()),
        header,
        path,
        link_target,
        size,
        mode,
        mtime,
        pax: pending.pax,
        long_link: pending.long_link.map(|(raw, _)| raw),
    })
}

/// Parses a decimal PAX value, dropping any fractional part.
fn pax_number(key: &str, value: &[u8]) -> Result<u64> {
    str::from_utf8(value)
        .ok()
        .and_then(|value| value.split('.').next())
        .and_then(|whole| whole.parse().ok())
        .ok_or_else(|| {
            StageError::malformed(format!(
                "invalid PAX {key} value {:?}",
                String::from_utf8_lossy(value)
            ))
        })
}

#[cfg(test)]
mod tests {
    use std::io;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{append_dir, append_file, create_tar_with};

    async fn read_all(data: &[u8]) -> Result<Vec<(TarEntry, Vec<u8>)>> {
        let mut reader = ArchiveReader::new(data);
        let mut entries = vec![];
        while let Some(entry) = reader.next_entry().await? {
            let mut body = vec![];
            while let Some(chunk) = reader.read_body().await? {
                body.extend_from_slice(&chunk);
            }
            entries.push((entry, body));
        }
        Ok(entries)
    }

    #[tokio::test]
    async fn test_empty_tar() {
        let data = create_tar_with(|_| {});
        assert!(read_all(&data).await.unwrap().is_empty());

        // no end marker at all is also a clean end
        assert!(read_all(b"").await.unwrap().is_empty());
        let no_marker = create_tar_with(|b| append_file(b, "f", b"x"));
        assert_eq!(read_all(&no_marker[..1024]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_entries_in_order() {
        let data = create_tar_with(|b| {
            append_dir(b, "repo/");
            append_file(b, "repo/a.txt", b"first");
            append_file(b, "repo/b.txt", &[7u8; 1000]);
        });

        let entries = read_all(&data).await.unwrap();
        let names: Vec<_> = entries.iter().map(|(e, _)| e.name().into_owned()).collect();
        assert_eq!(names, ["repo/", "repo/a.txt", "repo/b.txt"]);

        assert_eq!(entries[0].0.kind(), EntryKind::Directory);
        assert_eq!(entries[1].0.kind(), EntryKind::Regular);
        assert_eq!(entries[1].0.mode(), 0o644);
        assert_eq!(entries[1].0.mtime(), 1234567890);
        assert_eq!(entries[1].1, b"first");
        assert_eq!(entries[2].1, vec![7u8; 1000]);
    }

    #[tokio::test]
    async fn test_unread_body_is_skipped() {
        let data = create_tar_with(|b| {
            append_file(b, "one", &[1u8; 3000]);
            append_file(b, "two", b"2");
        });

        let mut reader = ArchiveReader::new(&data[..]);
        assert_eq!(reader.next_entry().await.unwrap().unwrap().name(), "one");
        // take one chunk and abandon the rest
        reader.read_body().await.unwrap().unwrap();
        assert_eq!(reader.next_entry().await.unwrap().unwrap().name(), "two");
        assert_eq!(reader.read_body().await.unwrap().as_deref(), Some(&b"2"[..]));
        assert!(reader.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_gnu_long_name_and_link() {
        let long_name = format!("repo/{}/file", "n".repeat(150));
        let long_target = format!("../{}", "t".repeat(150));
        let data = create_tar_with(|b| {
            append_file(b, &long_name, b"x");
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            b.append_link(&mut header, "repo/link", &long_target)
                .unwrap();
        });

        let entries = read_all(&data).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.name(), long_name);
        assert!(entries[0].0.long_link.is_none());
        assert_eq!(entries[1].0.kind(), EntryKind::Symlink);
        assert_eq!(entries[1].0.link_target(), Some(long_target.as_bytes()));
        assert!(entries[1].0.long_link.is_some());
    }

    #[tokio::test]
    async fn test_pax_overrides() {
        let data = create_tar_with(|b| {
            b.append_pax_extensions([("path", &b"repo/from-pax"[..]), ("mtime", &b"42.5"[..])])
                .unwrap();
            append_file(b, "repo/from-header", b"body");
        });

        let entries = read_all(&data).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.name(), "repo/from-pax");
        assert_eq!(entries[0].0.mtime(), 42);
        assert!(entries[0].0.pax.is_some());
        assert_eq!(entries[0].1, b"body");
    }

    #[tokio::test]
    async fn test_global_header_is_an_entry() {
        let data = create_tar_with(|b| {
            let records = b"52 comment=0123456789abcdef0123456789abcdef01234567\n";
            let mut header = tar::Header::new_ustar();
            header.set_path("pax_global_header").unwrap();
            header.set_entry_type(tar::EntryType::XGlobalHeader);
            header.set_size(records.len() as u64);
            header.set_cksum();
            b.append(&header, &records[..]).unwrap();
            append_file(b, "repo/a", b"a");
        });

        let entries = read_all(&data).await.unwrap();
        assert_eq!(entries[0].0.kind(), EntryKind::GlobalMetadata);
        assert_eq!(entries[1].0.name(), "repo/a");
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let data = create_tar_with(|b| append_file(b, "f", &[1u8; 2000]));
        let truncated = &data[..512 + 1000];

        let err = read_all(truncated).await.unwrap_err();
        assert!(matches!(err, StageError::MalformedArchive { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let data = create_tar_with(|b| append_file(b, "f", b"x"));
        let err = read_all(&data[..100]).await.unwrap_err();
        assert!(matches!(err, StageError::MalformedArchive { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_lone_zero_block_before_entries() {
        let one = create_tar_with(|b| append_file(b, "repo/one", b"1"));
        let two = create_tar_with(|b| append_file(b, "repo/two", b"2"));

        // header and body of "one", a single zero block, then a whole archive
        let mut data = one[..1024].to_vec();
        data.extend_from_slice(&[0u8; 512]);
        data.extend_from_slice(&two);

        let mut reader = ArchiveReader::new(&data[..]);
        assert_eq!(reader.next_entry().await.unwrap().unwrap().name(), "repo/one");
        let err = reader.next_entry().await.unwrap_err();
        assert!(matches!(err, StageError::MalformedArchive { .. }), "{err}");
        assert!(err.to_string().contains("zero block followed by"), "{err}");
    }

    #[tokio::test]
    async fn test_single_zero_block_at_eof() {
        let one = create_tar_with(|b| append_file(b, "repo/one", b"1"));
        let mut data = one[..1024].to_vec();
        data.extend_from_slice(&[0u8; 512]);

        let entries = read_all(&data).await.unwrap();
        assert_eq!(entries.len(), 1);

        // anything after the second zero block is not looked at
        let mut data = one.clone();
        data.extend_from_slice(b"trailing junk");
        assert_eq!(read_all(&data).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_orphaned_metadata() {
        let data = create_tar_with(|b| {
            b.append_pax_extensions([("path", &b"nowhere"[..])]).unwrap();
        });
        let err = read_all(&data).await.unwrap_err();
        assert!(err.to_string().contains("without a following entry"), "{err}");
    }

    #[tokio::test]
    async fn test_upstream_error() {
        let data = create_tar_with(|b| append_file(b, "f", &[1u8; 600]));
        let mut reader = tokio_test::io::Builder::new()
            .read(&data[..700])
            .read_error(io::ErrorKind::ConnectionReset.into())
            .build();

        let mut archive = ArchiveReader::new(&mut reader);
        archive.next_entry().await.unwrap().unwrap();
        let err = loop {
            match archive.read_body().await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("body should not complete"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, StageError::UpstreamIo { .. }), "{err}");
    }
}
