//! Framed binary transport over a duplex byte stream.
//!
//! Writes are buffered in a fixed-capacity region so that many small
//! primitives batch into one syscall; [`FrameWriter::flush`] is the only
//! point buffered data is guaranteed to leave the process. File payloads
//! travel as repeated `(length: i32, bytes)` frames terminated by a
//! frame with length `-1`; a reader may drain such a stream into a null
//! sink to decline a transfer without desynchronizing the connection.
//!
//! This layer never times out on its own; sessions wrap reads in
//! `tokio::time::timeout` as their state machines require.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::config::{NetConfig, ProtocolConfig};
use crate::error::{Result, SyncError};

/// Buffered writer for the framed protocol primitives.
pub struct FrameWriter<W> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(NetConfig::WRITE_BUF_SIZE),
        }
    }

    /// Buffer a single byte.
    pub fn write_u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// Buffer raw bytes verbatim.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffer a 32-bit big-endian integer.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Buffer a length-prefixed UTF-8 string (1-byte prefix, ≤255 byte
    /// payload). Oversized input is a hard failure before any byte is
    /// buffered.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        let bytes = s.as_bytes();
        if bytes.len() > ProtocolConfig::MAX_STRING_LEN {
            return Err(SyncError::StringTooLong(bytes.len()));
        }
        self.buf.push(bytes.len() as u8);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Flush all buffered bytes to the underlying stream.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf).await?;
            self.buf.clear();
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Write a chunked payload: `(len, bytes)` frames followed by the
    /// `-1` terminator. Flushes the pending buffer first and after each
    /// frame, so arbitrarily large payloads never outgrow the buffer.
    pub async fn write_chunked(&mut self, data: &[u8]) -> Result<()> {
        self.flush().await?;
        for chunk in data.chunks(NetConfig::CHUNK_SIZE) {
            self.write_i32(chunk.len() as i32);
            self.buf.extend_from_slice(chunk);
            self.flush().await?;
        }
        self.write_i32(-1);
        self.flush().await
    }

    /// Flush and shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Buffered reader mirroring [`FrameWriter`].
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::with_capacity(NetConfig::READ_BUF_SIZE, inner),
        }
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        Ok(self.inner.read_u8().await?)
    }

    pub async fn read_i32(&mut self) -> Result<i32> {
        Ok(self.inner.read_i32().await?)
    }

    pub async fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Read a length-prefixed UTF-8 string.
    pub async fn read_string(&mut self) -> Result<String> {
        let len = self.inner.read_u8().await? as usize;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        String::from_utf8(buf).map_err(|_| SyncError::transport("string payload is not UTF-8"))
    }

    /// Read the 20-byte connection preamble and compare it to the
    /// protocol magic + version. A mismatch is reported as `false`; the
    /// caller decides whether to drop silently.
    pub async fn preamble_matches(&mut self) -> Result<bool> {
        let preamble = self.read_array::<20>().await?;
        Ok(preamble[..16] == ProtocolConfig::MAGIC && preamble[16..] == ProtocolConfig::VERSION)
    }

    /// Read a chunked payload to its `-1` terminator.
    ///
    /// With `sink = None` the bytes are discarded, which drains a
    /// transfer being declined while keeping the stream aligned. Any
    /// chunk length below `-1` or above the read buffer bound is a
    /// transport fault. `frame_timeout`,
    /// when set, bounds each individual frame read (not the transfer as
    /// a whole, so slow large payloads still complete as long as bytes
    /// keep arriving).
    pub async fn read_chunked(
        &mut self,
        mut sink: Option<&mut Vec<u8>>,
        frame_timeout: Option<Duration>,
    ) -> Result<u64> {
        let mut total: u64 = 0;
        loop {
            let len = maybe_timed(frame_timeout, "read chunk length", self.read_i32()).await?;
            if len == -1 {
                return Ok(total);
            }
            if len < -1 {
                return Err(SyncError::InvalidChunkLength(len));
            }
            // The declared length comes off the wire; no honest writer
            // sends a frame above the buffer bound, so reject it before
            // allocating for it.
            if len as usize > NetConfig::READ_BUF_SIZE {
                return Err(SyncError::InvalidChunkLength(len));
            }
            let mut remaining = len as usize;
            total += remaining as u64;
            match sink {
                Some(ref mut out) => {
                    let start = out.len();
                    out.resize(start + remaining, 0);
                    maybe_timed(
                        frame_timeout,
                        "read chunk payload",
                        async {
                            self.inner.read_exact(&mut out[start..]).await?;
                            Ok(())
                        },
                    )
                    .await?;
                }
                None => {
                    let mut scratch = [0u8; 8192];
                    while remaining > 0 {
                        let take = remaining.min(scratch.len());
                        maybe_timed(
                            frame_timeout,
                            "drain chunk payload",
                            async {
                                self.inner.read_exact(&mut scratch[..take]).await?;
                                Ok(())
                            },
                        )
                        .await?;
                        remaining -= take;
                    }
                }
            }
        }
    }
}

async fn maybe_timed<T, F>(
    timeout: Option<Duration>,
    operation: &'static str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| SyncError::Timeout { operation, after })?,
        None => fut.await,
    }
}
