//! File streaming for UPLOAD and DOWNLOAD.
//!
//! ## Upload (client to server)
//!
//! ```text
//! S: READY\n
//! C: <size>\n
//! C: <size raw bytes>
//! S: <status>\n          (written by the connection handler)
//! ```
//!
//! ## Download (server to client)
//!
//! ```text
//! S: READY <size>\n
//! S: <size raw bytes>
//! S: <status>\n
//! ```
//!
//! Both directions move data in chunks of the configured buffer size. The
//! declared size is trusted: the receiver stops after exactly that many bytes
//! so the next command line can follow on the same stream.

use crate::framer::LineFramer;
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Floor for elapsed time when computing throughput.
const MIN_ELAPSED: Duration = Duration::from_micros(1);

/// Direction of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Progress of one in-flight transfer.
#[derive(Debug)]
struct TransferSession {
    filename: String,
    total: u64,
    transferred: u64,
    started: Instant,
}

impl TransferSession {
    fn new(filename: &str, total: u64) -> Self {
        Self {
            filename: filename.to_string(),
            total,
            transferred: 0,
            started: Instant::now(),
        }
    }

    /// Bytes to ask for next, never more than what is still owed.
    fn next_chunk(&self, buffer_size: usize) -> usize {
        let remaining = self.total - self.transferred;
        remaining.min(buffer_size as u64) as usize
    }

    fn advance(&mut self, n: usize) {
        self.transferred += n as u64;
        debug_assert!(self.transferred <= self.total);
    }

    fn is_complete(&self) -> bool {
        self.transferred == self.total
    }

    fn finish(self, direction: Direction) -> TransferReport {
        TransferReport {
            filename: self.filename,
            direction,
            bytes: self.transferred,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Outcome of a transfer that moved every declared byte.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub filename: String,
    pub direction: Direction,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferReport {
    /// Throughput in KB/s.
    pub fn kbps(&self) -> f64 {
        throughput_kbps(self.bytes, self.elapsed)
    }

    /// Status line sent back to the client.
    pub fn status_line(&self) -> String {
        let verb = match self.direction {
            Direction::Upload => "uploaded",
            Direction::Download => "sent",
        };
        format!(
            "OK {} {}: {} bytes at {:.2} KB/s",
            verb,
            self.filename,
            self.bytes,
            self.kbps()
        )
    }
}

/// Bytes per second divided by 1024. Elapsed time is clamped so that a
/// transfer finishing within the clock resolution still yields a finite rate.
pub fn throughput_kbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.max(MIN_ELAPSED).as_secs_f64();
    (bytes as f64 / secs) / 1024.0
}

/// Transfer failures.
#[derive(Debug)]
pub enum TransferError {
    /// The socket failed; the connection cannot continue.
    Socket(io::Error),
    /// Peer closed before sending the size line.
    MissingSize,
    /// Size line was not a non-negative integer.
    InvalidSize(String),
    /// Requested download does not exist.
    NotFound(String),
    /// Local file could not be opened, written or read.
    File(String, io::Error),
    /// Peer closed mid-upload.
    Partial { received: u64, expected: u64 },
    /// Download source ended or failed after its size was announced.
    SourceFailed {
        filename: String,
        sent: u64,
        expected: u64,
    },
}

impl TransferError {
    /// Whether the error leaves the stream unusable for further commands.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            TransferError::Socket(_) | TransferError::SourceFailed { .. }
        )
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Socket(e) => write!(f, "socket error: {}", e),
            TransferError::MissingSize => write!(f, "no file size received"),
            TransferError::InvalidSize(s) => write!(f, "invalid file size: {}", s),
            TransferError::NotFound(name) => write!(f, "file not found: {}", name),
            TransferError::File(name, e) => write!(f, "file error on {}: {}", name, e),
            TransferError::Partial { received, expected } => {
                write!(f, "partial: received {} of {} bytes", received, expected)
            }
            TransferError::SourceFailed {
                filename,
                sent,
                expected,
            } => write!(
                f,
                "source {} failed after {} of {} bytes",
                filename, sent, expected
            ),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Socket(e) | TransferError::File(_, e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::Socket(e)
    }
}

/// Runs the UPLOAD and DOWNLOAD sub-protocols against files under `root`.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    root: PathBuf,
    buffer_size: usize,
}

impl TransferEngine {
    pub fn new(root: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            root: root.into(),
            buffer_size: buffer_size.max(1),
        }
    }

    fn resolve(&self, filename: &str) -> PathBuf {
        self.root.join(Path::new(filename))
    }

    /// Receive an upload into `filename`.
    ///
    /// Sends `READY`, reads the declared size line, then pulls exactly that
    /// many raw bytes off the stream. If the destination cannot be written
    /// the payload is still drained so the stream stays aligned on the next
    /// command line.
    pub async fn receive<R, W>(
        &self,
        filename: &str,
        framer: &mut LineFramer<R>,
        writer: &mut W,
    ) -> Result<TransferReport, TransferError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        writer.write_all(b"READY\n").await?;
        writer.flush().await?;

        let size_line = match framer.read_line().await? {
            Some(line) if !line.is_empty() => line,
            _ => return Err(TransferError::MissingSize),
        };
        let total: u64 = size_line
            .trim()
            .parse()
            .map_err(|_| TransferError::InvalidSize(size_line.clone()))?;

        let path = self.resolve(filename);
        let mut file_error = None;
        let mut file = match File::create(&path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Cannot create upload target");
                file_error = Some(e);
                None
            }
        };

        debug!(file = filename, bytes = total, "Receiving upload");

        let mut session = TransferSession::new(filename, total);
        let mut buffer = BytesMut::zeroed(self.buffer_size);

        while !session.is_complete() {
            let want = session.next_chunk(self.buffer_size);
            let n = framer.read_raw(&mut buffer[..want]).await?;
            if n == 0 {
                break;
            }

            if let Some(f) = file.as_mut() {
                if let Err(e) = f.write_all(&buffer[..n]).await {
                    warn!(file = %path.display(), error = %e, "Upload write failed, draining");
                    file_error = Some(e);
                    file = None;
                }
            }
            session.advance(n);
        }

        if let Some(mut f) = file {
            if let Err(e) = f.flush().await {
                file_error = Some(e);
            }
        }

        if !session.is_complete() {
            return Err(TransferError::Partial {
                received: session.transferred,
                expected: session.total,
            });
        }
        if let Some(e) = file_error {
            return Err(TransferError::File(filename.to_string(), e));
        }

        let report = session.finish(Direction::Upload);
        info!(
            file = %report.filename,
            bytes = report.bytes,
            kbps = report.kbps(),
            "Upload complete"
        );
        Ok(report)
    }

    /// Stream `filename` to the peer.
    ///
    /// Nothing is written when the file is missing. Once `READY <size>` has
    /// gone out the peer expects exactly that many bytes, so a source that
    /// comes up short is reported as a connection fault.
    pub async fn send<W>(&self, filename: &str, writer: &mut W) -> Result<TransferReport, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let path = self.resolve(filename);

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(TransferError::NotFound(filename.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TransferError::NotFound(filename.to_string()))
            }
            Err(e) => return Err(TransferError::File(filename.to_string(), e)),
        };
        let mut file = File::open(&path)
            .await
            .map_err(|e| TransferError::File(filename.to_string(), e))?;

        let total = metadata.len();
        writer
            .write_all(format!("READY {}\n", total).as_bytes())
            .await?;

        debug!(file = filename, bytes = total, "Sending download");

        let session = TransferSession::new(filename, total);
        let report = self.stream_to(session, &mut file, writer).await?;
        info!(
            file = %report.filename,
            bytes = report.bytes,
            kbps = report.kbps(),
            "Download complete"
        );
        Ok(report)
    }

    /// Copy the session's declared byte count from `source` to `writer`.
    ///
    /// A source that ends or fails early yields `SourceFailed`.
    async fn stream_to<R, W>(
        &self,
        mut session: TransferSession,
        source: &mut R,
        writer: &mut W,
    ) -> Result<TransferReport, TransferError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buffer = BytesMut::zeroed(self.buffer_size);

        while !session.is_complete() {
            let want = session.next_chunk(self.buffer_size);
            let n = match source.read(&mut buffer[..want]).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(file = %session.filename, error = %e, "Download read failed");
                    0
                }
            };
            if n == 0 {
                return Err(TransferError::SourceFailed {
                    filename: session.filename,
                    sent: session.transferred,
                    expected: session.total,
                });
            }

            writer.write_all(&buffer[..n]).await?;
            session.advance(n);
        }
        writer.flush().await?;

        Ok(session.finish(Direction::Download))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "filecast-transfer-{}-{}",
            name,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_throughput_is_finite_for_zero_elapsed() {
        let rate = throughput_kbps(4096, Duration::ZERO);
        assert!(rate.is_finite());
        assert!(rate > 0.0);
        assert_eq!(throughput_kbps(0, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_throughput_value() {
        let rate = throughput_kbps(2048, Duration::from_secs(2));
        assert!((rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_session_chunking() {
        let mut session = TransferSession::new("f", 2500);
        assert_eq!(session.next_chunk(1024), 1024);
        session.advance(1024);
        session.advance(1024);
        assert_eq!(session.next_chunk(1024), 452);
        session.advance(452);
        assert!(session.is_complete());
        assert_eq!(session.next_chunk(1024), 0);
    }

    #[tokio::test]
    async fn test_receive_writes_exact_payload() {
        let dir = scratch_dir("receive");
        let engine = TransferEngine::new(&dir, 4);

        // payload is followed by the next command, which must stay unread
        let reader = Builder::new().read(b"10\n0123456789TIME\n").build();
        let mut framer = LineFramer::new(reader);
        let mut writer = Builder::new().write(b"READY\n").build();

        let report = engine
            .receive("up.bin", &mut framer, &mut writer)
            .await
            .unwrap();
        assert_eq!(report.bytes, 10);
        assert_eq!(report.direction, Direction::Upload);
        assert!(report.status_line().starts_with("OK uploaded up.bin: 10 bytes at "));
        assert_eq!(std::fs::read(dir.join("up.bin")).unwrap(), b"0123456789");

        assert_eq!(framer.read_line().await.unwrap().as_deref(), Some("TIME"));
    }

    #[tokio::test]
    async fn test_receive_zero_size() {
        let dir = scratch_dir("zero");
        let engine = TransferEngine::new(&dir, 1024);

        let reader = Builder::new().read(b"0\n").build();
        let mut framer = LineFramer::new(reader);
        let mut writer = Builder::new().write(b"READY\n").build();

        let report = engine
            .receive("empty.bin", &mut framer, &mut writer)
            .await
            .unwrap();
        assert_eq!(report.bytes, 0);
        assert_eq!(std::fs::read(dir.join("empty.bin")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_receive_invalid_size_creates_nothing() {
        let dir = scratch_dir("invalid");
        let engine = TransferEngine::new(&dir, 1024);

        let reader = Builder::new().read(b"lots\n").build();
        let mut framer = LineFramer::new(reader);
        let mut writer = Builder::new().write(b"READY\n").build();

        let err = engine
            .receive("never.bin", &mut framer, &mut writer)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidSize(ref s) if s == "lots"));
        assert!(!err.is_connection_fault());
        assert!(!dir.join("never.bin").exists());
    }

    #[tokio::test]
    async fn test_receive_missing_size() {
        let dir = scratch_dir("missing");
        let engine = TransferEngine::new(&dir, 1024);

        let reader = Builder::new().build();
        let mut framer = LineFramer::new(reader);
        let mut writer = Builder::new().write(b"READY\n").build();

        let err = engine
            .receive("never.bin", &mut framer, &mut writer)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::MissingSize));
    }

    #[tokio::test]
    async fn test_receive_partial_when_peer_closes() {
        let dir = scratch_dir("partial");
        let engine = TransferEngine::new(&dir, 1024);

        let reader = Builder::new().read(b"20\nonly-ten!!").build();
        let mut framer = LineFramer::new(reader);
        let mut writer = Builder::new().write(b"READY\n").build();

        let err = engine
            .receive("part.bin", &mut framer, &mut writer)
            .await
            .unwrap_err();
        match err {
            TransferError::Partial { received, expected } => {
                assert_eq!(received, 10);
                assert_eq!(expected, 20);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receive_drains_when_target_unwritable() {
        let dir = scratch_dir("unwritable");
        let engine = TransferEngine::new(&dir, 2);

        let reader = Builder::new().read(b"4\nabcdQUIT\n").build();
        let mut framer = LineFramer::new(reader);
        let mut writer = Builder::new().write(b"READY\n").build();

        let err = engine
            .receive("no-such-dir/file.bin", &mut framer, &mut writer)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::File(..)));
        assert!(!err.is_connection_fault());
        assert_eq!(framer.read_line().await.unwrap().as_deref(), Some("QUIT"));
    }

    #[tokio::test]
    async fn test_send_streams_file() {
        let dir = scratch_dir("send");
        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        std::fs::write(dir.join("down.bin"), &payload).unwrap();
        let engine = TransferEngine::new(&dir, 1024);

        let (mut server_side, mut client_side) = duplex(64 * 1024);
        let report = engine.send("down.bin", &mut server_side).await.unwrap();
        drop(server_side);

        let mut received = Vec::new();
        client_side.read_to_end(&mut received).await.unwrap();

        let header = b"READY 3000\n";
        assert_eq!(&received[..header.len()], header);
        assert_eq!(&received[header.len()..], &payload[..]);
        assert_eq!(report.bytes, 3000);
        assert!(report.kbps() > 0.0);
    }

    #[tokio::test]
    async fn test_send_missing_file_writes_nothing() {
        let dir = scratch_dir("send-missing");
        let engine = TransferEngine::new(&dir, 1024);

        let mut writer = Builder::new().build();
        let err = engine.send("ghost.bin", &mut writer).await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound(ref n) if n == "ghost.bin"));
        assert_eq!(err.to_string(), "file not found: ghost.bin");
    }

    #[tokio::test]
    async fn test_short_source_is_connection_fault() {
        let engine = TransferEngine::new(std::env::temp_dir(), 4);

        // source promises 10 bytes but ends after 6
        let mut source = Builder::new().read(b"abcdef").build();
        let mut writer = Builder::new().write(b"abcd").write(b"ef").build();
        let session = TransferSession::new("shrunk.bin", 10);

        let err = engine
            .stream_to(session, &mut source, &mut writer)
            .await
            .unwrap_err();
        match err {
            TransferError::SourceFailed {
                ref filename,
                sent,
                expected,
            } => {
                assert_eq!(filename, "shrunk.bin");
                assert_eq!(sent, 6);
                assert_eq!(expected, 10);
            }
            ref other => panic!("unexpected: {:?}", other),
        }
        assert!(err.is_connection_fault());
    }

    #[tokio::test]
    async fn test_source_read_error_is_connection_fault() {
        let engine = TransferEngine::new(std::env::temp_dir(), 1024);

        let mut source = Builder::new()
            .read(b"xyz")
            .read_error(io::Error::new(io::ErrorKind::Other, "disk gone"))
            .build();
        let mut writer = Builder::new().write(b"xyz").build();
        let session = TransferSession::new("flaky.bin", 8);

        let err = engine
            .stream_to(session, &mut source, &mut writer)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceFailed { sent: 3, expected: 8, .. }));
        assert!(err.is_connection_fault());
    }

    #[test]
    fn test_partial_message() {
        let err = TransferError::Partial {
            received: 3,
            expected: 9,
        };
        assert_eq!(err.to_string(), "partial: received 3 of 9 bytes");
    }
}
