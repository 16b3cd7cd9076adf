//! Client side of the command protocol.
//!
//! Speaks the same wire format as the server: one command line out, one
//! reply line back, with UPLOAD and DOWNLOAD switching to raw bytes for the
//! declared payload in between.

use crate::framer::LineFramer;
use crate::transfer::throughput_kbps;
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Chunk size used when none is given.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Client errors
#[derive(Debug)]
pub enum ClientError {
    /// Socket or local file failure
    Io(io::Error),
    /// Server answered with something other than READY
    Rejected(String),
    /// READY line without a usable size
    InvalidReady(String),
    /// Server closed before the declared payload arrived
    Incomplete { received: u64, expected: u64 },
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "I/O error: {}", e),
            ClientError::Rejected(reply) => write!(f, "server rejected transfer: {}", reply),
            ClientError::InvalidReady(line) => write!(f, "malformed READY line: {}", line),
            ClientError::Incomplete { received, expected } => {
                write!(f, "connection closed after {} of {} bytes", received, expected)
            }
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

/// Result of a completed transfer as seen by the client.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    /// Status line sent by the server.
    pub status: String,
    pub bytes: u64,
    /// Client-side throughput in KB/s.
    pub kbps: f64,
}

/// A connected client
pub struct Client {
    framer: LineFramer<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    buffer_size: usize,
}

impl Client {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        socket2::SockRef::from(&stream).set_keepalive(true)?;

        let (reader, writer) = stream.into_split();
        Ok(Client {
            framer: LineFramer::new(reader),
            writer,
            buffer_size: DEFAULT_BUFFER_SIZE,
        })
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    async fn send_line(&mut self, line: &str) -> io::Result<()> {
        let mut out = BytesMut::with_capacity(line.len() + 1);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\n");
        self.writer.write_all(&out).await?;
        self.writer.flush().await
    }

    async fn reply(&mut self) -> io::Result<String> {
        self.framer.read_line().await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection")
        })
    }

    /// Send a regular command and return the reply line.
    pub async fn command(&mut self, line: &str) -> io::Result<String> {
        self.send_line(line).await?;
        self.reply().await
    }

    /// Upload the local file at `local` under the name `remote`.
    pub async fn upload(&mut self, local: &Path, remote: &str) -> Result<TransferSummary, ClientError> {
        // fail before the server starts waiting for a size
        let mut file = File::open(local).await?;
        let size = file.metadata().await?.len();

        self.send_line(&format!("UPLOAD {}", remote)).await?;
        let ready = self.reply().await?;
        if ready != "READY" {
            return Err(ClientError::Rejected(ready));
        }

        let started = Instant::now();
        self.send_line(&size.to_string()).await?;

        let mut buffer = BytesMut::zeroed(self.buffer_size);
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(self.buffer_size as u64) as usize;
            let n = file.read(&mut buffer[..want]).await?;
            if n == 0 {
                return Err(ClientError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "local file shrank during upload",
                )));
            }
            self.writer.write_all(&buffer[..n]).await?;
            remaining -= n as u64;
        }
        self.writer.flush().await?;

        let status = self.reply().await?;
        let kbps = throughput_kbps(size, started.elapsed());
        debug!(file = remote, bytes = size, kbps, "Upload finished");

        Ok(TransferSummary {
            status,
            bytes: size,
            kbps,
        })
    }

    /// Download `remote` into the local file at `local`.
    pub async fn download(&mut self, remote: &str, local: &Path) -> Result<TransferSummary, ClientError> {
        self.send_line(&format!("DOWNLOAD {}", remote)).await?;

        let ready = self.reply().await?;
        let size = match ready.strip_prefix("READY") {
            Some(rest) => rest
                .trim()
                .parse::<u64>()
                .map_err(|_| ClientError::InvalidReady(ready.clone()))?,
            None => return Err(ClientError::Rejected(ready)),
        };

        let started = Instant::now();
        let mut file = File::create(local).await?;
        let mut buffer = BytesMut::zeroed(self.buffer_size);
        let mut received = 0u64;
        while received < size {
            let want = (size - received).min(self.buffer_size as u64) as usize;
            let n = self.framer.read_raw(&mut buffer[..want]).await?;
            if n == 0 {
                return Err(ClientError::Incomplete {
                    received,
                    expected: size,
                });
            }
            file.write_all(&buffer[..n]).await?;
            received += n as u64;
        }
        file.flush().await?;

        let status = self.reply().await?;
        let kbps = throughput_kbps(size, started.elapsed());
        debug!(file = remote, bytes = size, kbps, "Download finished");

        Ok(TransferSummary {
            status,
            bytes: size,
            kbps,
        })
    }

    /// Send CLOSE and return the acknowledgement.
    pub async fn close(mut self) -> io::Result<String> {
        self.command("CLOSE").await
    }
}
