//! Per-connection command loop.
//!
//! A session alternates between waiting for a command line and dispatching
//! it, until the peer closes, sends a closing verb, or the socket fails.
//! Shutdown cancels the session at whatever await point it is parked in,
//! which drops the socket.

use crate::command::Dispatcher;
use crate::framer::LineFramer;
use crate::server::ServerContext;
use bytes::{BufMut, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer closed the stream (or sent an empty line).
    PeerClosed,
    /// Peer sent CLOSE, EXIT or QUIT and received the acknowledgement.
    ClientClosed,
    /// The server force-closed the connection during shutdown.
    Shutdown,
}

/// Run the command loop until the session terminates.
///
/// Socket errors are returned as `Err` without any attempt to answer.
pub async fn run_session<R, W>(
    framer: &mut LineFramer<R>,
    writer: &mut W,
    dispatcher: &Dispatcher,
) -> io::Result<SessionEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut response = BytesMut::with_capacity(256);

    loop {
        let line = match framer.read_line().await? {
            Some(line) if !line.is_empty() => line,
            _ => return Ok(SessionEnd::PeerClosed),
        };
        trace!(command = %line, "Processing command");

        let reply = dispatcher.dispatch(&line, framer, writer).await?;

        response.clear();
        response.extend_from_slice(reply.text.as_bytes());
        response.put_u8(b'\n');
        writer.write_all(&response).await?;
        writer.flush().await?;

        if reply.close {
            return Ok(SessionEnd::ClientClosed);
        }
    }
}

/// Own one accepted connection for its whole lifetime.
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, context: Arc<ServerContext>) {
    let registration = context.registry().register(peer);

    // a shutdown that snapshotted the registry before we registered
    if !context.is_running() {
        debug!(peer = %peer, "Server stopping, dropping new connection");
        drop(stream);
        return;
    }

    let peer = registration.peer();
    debug!(conn = registration.id(), peer = %peer, "New connection");

    let (reader, mut writer) = stream.into_split();
    let mut framer = LineFramer::new(reader);

    let outcome = tokio::select! {
        biased;
        _ = registration.closed() => Ok(SessionEnd::Shutdown),
        result = run_session(&mut framer, &mut writer, context.dispatcher()) => result,
    };

    // close the socket before leaving the registry
    drop(framer);
    drop(writer);

    match outcome {
        Ok(end) => debug!(conn = registration.id(), peer = %peer, ?end, "Connection closed"),
        Err(e) => debug!(conn = registration.id(), peer = %peer, error = %e, "Connection fault"),
    }
}
