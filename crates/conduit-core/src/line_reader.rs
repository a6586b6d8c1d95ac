//! Unbounded newline framing over an async byte stream (C5).
//!
//! `tokio::io::AsyncBufReadExt::read_line` is bounded by the underlying
//! `BufReader`'s capacity in practice; agent stdout frequently emits single
//! JSON lines well past that, so the bridge layer owns its own reader
//! instead of relying on it.

use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE: usize = 256 * 1024;

/// Reads newline-terminated lines of unbounded size from an async reader.
///
/// State is per-instance: a fresh `LineReader` must be created for each
/// subprocess spawn. On EOF, any residual bytes are returned exactly once as
/// a final "line" (without a trailing newline), then the reader reports EOF
/// forever after.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            eof: false,
        }
    }

    /// Returns the next line (without its trailing `\n`), or `None` at EOF
    /// once all residual buffered bytes have been drained.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let tail = self.buf.split_off(pos + 1);
                let mut line = std::mem::replace(&mut self.buf, tail);
                line.pop(); // drop the newline
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let residual = std::mem::take(&mut self.buf);
                return Ok(Some(String::from_utf8_lossy(&residual).into_owned()));
            }

            let mut chunk = vec![0u8; CHUNK_SIZE];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
                continue;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}
