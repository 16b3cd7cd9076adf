//! TCP listener and shutdown coordination.
//!
//! The accept loop spawns one task per connection. Shutdown clears the
//! running flag, wakes the accept loop so it drops the listening socket, and
//! force-closes every registered connection.

use crate::command::Dispatcher;
use crate::config::Config;
use crate::connection::handle_connection;
use crate::registry::ConnectionRegistry;
use crate::transfer::TransferEngine;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for handlers to deregister.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: i32 = 1024;

/// State shared by the accept loop, every connection task and the
/// shutdown handle.
#[derive(Debug)]
pub struct ServerContext {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    running: AtomicBool,
    stop: Notify,
    keepalive: bool,
}

impl ServerContext {
    fn new(config: &Config) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            dispatcher: Dispatcher::new(TransferEngine::new(
                config.root.clone(),
                config.buffer_size,
            )),
            running: AtomicBool::new(true),
            stop: Notify::new(),
            keepalive: config.keepalive,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ServerContext>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind the listening socket. Failing here is the only fatal error.
    pub async fn bind(config: &Config) -> io::Result<Self> {
        let addr = tokio::net::lookup_host(&config.listen)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for {}", config.listen),
                )
            })?;

        let listener = TcpListener::from_std(create_listener(addr)?)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Server listening");

        Ok(Server {
            listener,
            local_addr,
            context: Arc::new(ServerContext::new(config)),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            context: Arc::clone(&self.context),
        }
    }

    /// Accept connections until shutdown. The listening socket is closed
    /// when this returns.
    pub async fn run(self) -> io::Result<()> {
        let Server {
            listener,
            context,
            connection_limit,
            ..
        } = self;

        while context.is_running() {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = context.stop.notified() => break,
                permit = Arc::clone(&connection_limit).acquire_owned() => {
                    permit.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                }
            };

            let accepted = tokio::select! {
                _ = context.stop.notified() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = configure_stream(&stream, context.keepalive) {
                        warn!(peer = %peer, error = %e, "Failed to set socket options");
                    }

                    let context = Arc::clone(&context);
                    tokio::spawn(async move {
                        handle_connection(stream, peer, context).await;
                        drop(permit);
                    });
                }
                Err(e) if !context.is_running() => {
                    debug!(error = %e, "Accept interrupted by shutdown");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        drop(listener);
        info!("Stopped accepting connections");
        Ok(())
    }
}

/// Triggers and observes shutdown from outside the accept loop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    context: Arc<ServerContext>,
}

impl ShutdownHandle {
    /// Stop accepting and force-close every live connection.
    ///
    /// Returns the number of connections signalled. Calling it again is a
    /// no-op returning 0.
    pub fn shutdown(&self) -> usize {
        if !self.context.running.swap(false, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return 0;
        }

        info!("Shutting down server");
        self.context.stop.notify_one();
        let closed = self.context.registry.close_all();
        info!(connections = closed, "Closing active connections");
        closed
    }

    /// Wait up to `limit` for every connection handler to finish.
    pub async fn wait_for_drain(&self, limit: Duration) -> bool {
        let drained = self.context.registry.wait_until_empty(limit).await;
        if !drained {
            warn!(
                remaining = self.context.registry.len(),
                "Connections still open after shutdown timeout"
            );
        }
        drained
    }

    pub fn is_running(&self) -> bool {
        self.context.is_running()
    }

    pub fn active_connections(&self) -> usize {
        self.context.registry.len()
    }
}

/// Resolve when the process is asked to stop (Ctrl-C, or SIGTERM on Unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

fn configure_stream(stream: &TcpStream, keepalive: bool) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if keepalive {
        socket2::SockRef::from(stream).set_keepalive(true)?;
    }
    Ok(())
}
