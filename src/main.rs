//! alpha-redis: a minimal concurrent TCP command server
//!
//! Every accepted connection gets its own task that reads a command,
//! writes the same bytes back, and repeats until the client leaves.
//!
//! Features:
//! - One independent handler per connection
//! - Optional connection limit and per-connection read/write deadlines
//! - Transient accept errors retried with backoff
//! - Graceful shutdown on Ctrl-C
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod handler;
mod listener;

use config::Config;
use error::ServerError;
use listener::Listener;
use tracing::{error, info};
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
        host = %config.server.host,
        port = %config.server.port,
        buffer_size = config.buffer_size,
        max_connections = config.max_connections,
        workers = ?config.workers,
        "Starting alpha-redis server"
    );

    // Fatal server errors end the process with a non-zero status.
    if let Err(e) = start(config) {
        error!(error = %e, "Server stopped");
        std::process::exit(1);
    }

    info!("Server stopped");
    Ok(())
}

fn start(config: Config) -> Result<(), ServerError> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder
        .thread_name("alpha-redis-worker")
        .enable_all()
        .build()
        .map_err(ServerError::Runtime)?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), ServerError> {
    let listener = Listener::bind(&config).await?;

    listener
        .serve_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
}
