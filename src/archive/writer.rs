//! Re-encoding entries under a new name.

use bytes::Bytes;
use tar::PaxExtensions;

use super::{header, TarEntry, BLOCK_SIZE};
use crate::error::{Result, StageError};

static ZEROES: [u8; 1024] = [0; 1024];

/// Two zero blocks: the end-of-archive marker.
pub fn end_of_archive() -> Bytes {
    Bytes::from_static(&ZEROES)
}

/// The zero padding that follows a body of `size` bytes.
pub fn padding(size: u64) -> Bytes {
    let len = (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE;
    Bytes::from_static(&ZEROES[..len as usize])
}

/// Encodes every block that goes in front of `entry`'s body when it's renamed to `path`.
///
/// The entry's own header block is kept as read except for the name field; mode, size,
/// typeflag, times, ownership and link target stay what they were.  Names that don't fit the
/// header get carried by the entry's PAX records if it has any (their `path` is replaced), or
/// else by a new GNU long name record.  A GNU long link record is written back unchanged.
pub fn encode_header(entry: &TarEntry, path: &[u8]) -> Result<Bytes> {
    let mut out = vec![];

    if let Some(pax) = &entry.pax {
        let data = replace_pax_path(&pax.data, path)?;
        let mut pax_header = pax.header.clone();
        pax_header.set_size(data.len() as u64);
        pax_header.set_cksum();
        push_record(&mut out, &pax_header, &data);
    } else if path.len() > header::NAME_FIELD_LEN {
        let mut data = path.to_vec();
        data.push(0);
        push_record(&mut out, &header::gnu_long_name(data.len() as u64), &data);
    }

    if let Some(raw) = &entry.long_link {
        out.extend_from_slice(raw);
    }

    let mut header = entry.header.clone();
    header::set_name(&mut header, path);
    out.extend_from_slice(header.as_bytes());

    Ok(out.into())
}

fn push_record(out: &mut Vec<u8>, header: &tar::Header, data: &[u8]) {
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&padding(data.len() as u64));
}

/// Rewrites a PAX record set so its `path` is `path`.
///
/// Every other record is kept byte for byte.  When there was no `path` record one is only
/// added if the name doesn't fit in the header.
fn replace_pax_path(records: &[u8], path: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![];
    let mut replaced = false;

    for extension in PaxExtensions::new(records) {
        let extension = extension
            .map_err(|err| StageError::malformed(format!("invalid PAX record: {err}")))?;
        let key = extension
            .key()
            .map_err(|err| StageError::malformed(format!("invalid PAX key: {err}")))?;

        if key == "path" {
            if !replaced {
                push_pax_record(&mut out, "path", path);
                replaced = true;
            }
        } else {
            push_pax_record(&mut out, key, extension.value_bytes());
        }
    }

    if !replaced && path.len() > header::NAME_FIELD_LEN {
        push_pax_record(&mut out, "path", path);
    }

    Ok(out)
}

/// Appends one `"<len> <key>=<value>\n"` record, where `len` counts the whole record
/// including its own digits.
fn push_pax_record(out: &mut Vec<u8>, key: &str, value: &[u8]) {
    // " " + key + "=" + value + "\n"
    let rest = key.len() + value.len() + 3;
    let mut len = rest + 1;
    while len != rest + len.to_string().len() {
        len = rest + len.to_string().len();
    }

    out.extend_from_slice(len.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(key.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value);
    out.push(b'\n');
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        archive::ArchiveReader,
        test::{append_file, create_tar_with, list_tar},
    };

    async fn first_entry(data: &[u8]) -> TarEntry {
        ArchiveReader::new(data)
            .next_entry()
            .await
            .unwrap()
            .unwrap()
    }

    /// Re-encodes `entry` as `path`, followed by `body`, as a complete archive.
    fn rewrap(entry: &TarEntry, path: &str, body: &[u8]) -> Vec<u8> {
        let mut data = encode_header(entry, path.as_bytes()).unwrap().to_vec();
        data.extend_from_slice(body);
        data.extend_from_slice(&padding(body.len() as u64));
        data.extend_from_slice(&end_of_archive());
        data
    }

    #[test]
    fn test_padding() {
        assert_eq!(padding(0).len(), 0);
        assert_eq!(padding(1).len(), 511);
        assert_eq!(padding(512).len(), 0);
        assert_eq!(padding(1000).len(), 24);
        assert_eq!(end_of_archive().len(), 1024);
    }

    #[test]
    fn test_pax_record_length() {
        let mut out = vec![];
        push_pax_record(&mut out, "path", b"abc");
        assert_eq!(out, b"12 path=abc\n");

        // the length field growing a digit pushes the record over 100
        let mut out = vec![];
        let value = "v".repeat(91);
        push_pax_record(&mut out, "path", value.as_bytes());
        assert_eq!(out.len(), 101);
        assert!(out.starts_with(b"101 path="));
    }

    #[test]
    fn test_replace_pax_path_keeps_other_records() {
        let mut records = vec![];
        push_pax_record(&mut records, "mtime", b"1.5");
        push_pax_record(&mut records, "path", b"repo/old");
        push_pax_record(&mut records, "uname", b"someone");

        let rewritten = replace_pax_path(&records, b"old").unwrap();
        let mut expected = vec![];
        push_pax_record(&mut expected, "mtime", b"1.5");
        push_pax_record(&mut expected, "path", b"old");
        push_pax_record(&mut expected, "uname", b"someone");
        assert_eq!(rewritten, expected);
    }

    #[tokio::test]
    async fn test_rename_keeps_fields() {
        let data = create_tar_with(|b| append_file(b, "repo/dir/file.txt", b"hello"));
        let entry = first_entry(&data).await;

        let out = rewrap(&entry, "dir/file.txt", b"hello");
        let renamed = first_entry(&out).await;
        assert_eq!(renamed.name(), "dir/file.txt");
        assert_eq!(renamed.size(), entry.size());
        assert_eq!(renamed.mode(), entry.mode());
        assert_eq!(renamed.mtime(), entry.mtime());
        assert_eq!(renamed.entry_type(), entry.entry_type());
        assert_eq!(
            list_tar(&out),
            [("dir/file.txt".to_string(), b"hello".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_rename_to_long_name() {
        let long = format!("repo/{}", "x".repeat(200));
        let data = create_tar_with(|b| append_file(b, &long, b"content"));
        let entry = first_entry(&data).await;

        // still too long for the header: a fresh GNU long name record carries it
        let out = rewrap(&entry, &long[5..], b"content");
        assert_eq!(list_tar(&out), [(long[5..].to_string(), b"content".to_vec())]);

        // short enough now: no extension record at all
        let out = rewrap(&entry, "short", b"content");
        assert_eq!(out.len(), 512 + 512 + 1024);
        assert_eq!(list_tar(&out), [("short".to_string(), b"content".to_vec())]);
    }

    #[tokio::test]
    async fn test_rename_with_pax() {
        let long = format!("repo/{}", "p".repeat(120));
        let data = create_tar_with(|b| {
            b.append_pax_extensions([("path", long.as_bytes()), ("uname", &b"me"[..])])
                .unwrap();
            append_file(b, "repo/short", b"pax body");
        });
        let entry = first_entry(&data).await;
        assert_eq!(entry.name(), long);

        let out = rewrap(&entry, &long[5..], b"pax body");
        let renamed = first_entry(&out).await;
        assert_eq!(renamed.name(), &long[5..]);
        assert_eq!(list_tar(&out), [(long[5..].to_string(), b"pax body".to_vec())]);
    }
}
