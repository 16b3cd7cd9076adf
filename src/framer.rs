//! Line framing over a byte stream.
//!
//! Commands arrive as newline-terminated text, but a file payload may follow
//! a command line on the same stream with no delimiter of its own. The framer
//! therefore never hands out bytes past the first newline as text: anything
//! already buffered after it stays in the reader and is returned by
//! [`LineFramer::read_raw`] when the transfer engine switches to raw mode.

use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Longest command line accepted before the peer is considered broken.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Buffered reader yielding newline-terminated lines or raw byte chunks.
pub struct LineFramer<R> {
    reader: BufReader<R>,
    line: BytesMut,
}

impl<R: AsyncRead + Unpin> LineFramer<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: BytesMut::with_capacity(256),
        }
    }

    /// Read one line, without its terminator and with trailing whitespace
    /// trimmed.
    ///
    /// Returns `Ok(None)` once the peer has closed and nothing is left to
    /// read. A final line without a newline is returned as-is.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        self.line.clear();

        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.line.is_empty() {
                    return Ok(None);
                }
                break;
            }

            if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                self.line.extend_from_slice(&available[..pos]);
                self.reader.consume(pos + 1);
                break;
            }

            let n = available.len();
            self.line.extend_from_slice(available);
            self.reader.consume(n);

            if self.line.len() > MAX_LINE_LENGTH {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "command line exceeds maximum length",
                ));
            }
        }

        let text = String::from_utf8_lossy(&self.line);
        Ok(Some(text.trim_end().to_string()))
    }

    /// Read up to `buf.len()` payload bytes, draining anything buffered
    /// behind the last line first. Returns 0 when the peer has closed.
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }
}
