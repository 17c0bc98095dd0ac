//! The gzip stage.

use async_compression::tokio::bufread::GzipEncoder;
use bytes::BytesMut;
use log::debug;
use tokio::{io::AsyncReadExt, task::JoinSet};

use crate::{
    archive::BODY_CHUNK_SIZE,
    conduit::{conduit, ByteStream, ConduitWriter, CONDUIT_CAPACITY},
    error::{Result, StageError},
};

/// Gzip-compresses a byte stream as it arrives.
///
/// A failure of the input stream is passed on as it is.  Only errors raised by the encoder
/// itself become [`StageError::CompressionFailure`].
#[derive(Debug)]
pub struct Compressor {
    input: ByteStream,
}

impl Compressor {
    pub fn new(input: ByteStream) -> Self {
        Self { input }
    }

    /// Starts the stage on `workers`, returning the compressed stream.
    pub fn spawn(self, workers: &mut JoinSet<()>) -> ByteStream {
        let (output, stream) = conduit(CONDUIT_CAPACITY);
        workers.spawn(self.run(output));
        stream
    }

    /// Runs the stage to completion, terminating `output` with a clean end or the first error.
    ///
    /// The gzip trailer is only written after the input ended cleanly.
    pub async fn run(self, mut output: ConduitWriter) {
        let cancelled = output.cancellation();
        let mut encoder = GzipEncoder::new(self.input);

        let result = tokio::select! {
            result = compress(&mut encoder, &mut output) => result,
            () = cancelled => Err(StageError::Cancelled),
        };

        match result {
            Ok(total) => {
                debug!("compressed stream complete, {total} bytes");
                output.finish().await;
            }
            Err(err) => {
                debug!("compression stopped: {err}");
                output.fail(err).await;
            }
        }
    }
}

async fn compress(encoder: &mut GzipEncoder<ByteStream>, output: &mut ConduitWriter) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let mut chunk = BytesMut::with_capacity(BODY_CHUNK_SIZE);
        let n = match encoder.read_buf(&mut chunk).await {
            Ok(n) => n,
            Err(err) => {
                return Err(match encoder.get_ref().failure() {
                    Some(upstream) => upstream.clone(),
                    None => StageError::compression(err),
                })
            }
        };

        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        output.write(chunk.freeze()).await?;
    }
}
