use std::io::{ErrorKind, Result};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// Fills `buf` from `reader`, telling a clean end of input apart from a short read.
///
/// Returns `Ok(true)` once `buf` is full and `Ok(false)` if the input ended before any byte was
/// read.  Ending part way through is an `UnexpectedEof` error; other errors from `reader` are
/// returned unchanged, except `Interrupted`, which is retried.
pub(crate) async fn read_exactish(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut [u8],
) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Reads and discards exactly `len` bytes.  Running out of input first is UnexpectedEof.
pub(crate) async fn skip_exact(reader: &mut (impl AsyncBufRead + Unpin), len: u64) -> Result<()> {
    let mut remaining = len;
    while remaining > 0 {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        let n = available.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        reader.consume(n);
        remaining -= n as u64;
    }
    Ok(())
}
