//! filecast server binary.
//!
//! Features:
//! - ECHO, TIME, UPLOAD, DOWNLOAD and CLOSE over a text protocol
//! - One task per connection
//! - Graceful stop on Ctrl-C / SIGTERM that closes every open connection
//! - Configuration via CLI arguments or TOML file

use filecast::config::Config;
use filecast::server::{self, Server, DEFAULT_SHUTDOWN_TIMEOUT};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        root = %config.root.display(),
        buffer_size = config.buffer_size,
        max_connections = config.max_connections,
        "Starting filecast server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(&config).await?;
    let handle = server.shutdown_handle();

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        signal_handle.shutdown();
    });

    server.run().await?;

    handle.wait_for_drain(DEFAULT_SHUTDOWN_TIMEOUT).await;
    info!("Server stopped");
    Ok(())
}
