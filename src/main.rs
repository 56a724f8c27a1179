//! reactor-engine: echo server built on the engine.
//!
//! Accepts raw-stream connections (and framed-message connections when a
//! framed listener is configured) and echoes every byte back. Runs until
//! Ctrl-C, then stops the engine and tears down all connections.

use reactor_engine::config::Config;
use reactor_engine::{Conn, Engine};
use tracing::{debug, info};
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
        framed_listen = ?config.framed_listen,
        workers = ?config.workers,
        idle_timeout = config.idle_timeout,
        "Starting reactor-engine"
    );

    let engine = Engine::new(config.options()?)?;

    engine.on_new_conn(|info| {
        debug!(fd = info.fd, peer = ?info.peer_addr, kind = ?info.kind, "New connection");
    });
    engine.on_data(|conn, data| {
        if let Err(e) = conn.write(data) {
            debug!(fd = conn.fd(), error = %e, "Echo failed");
            let _ = conn.close();
        }
    });
    engine.on_close(|conn| {
        debug!(fd = conn.fd(), "Connection closed");
    });

    engine.start()?;
    info!(
        addr = ?engine.listen_addr(),
        framed_addr = ?engine.framed_listen_addr(),
        "Accepting connections"
    );

    wait_for_shutdown()?;

    info!(connections = engine.conn_count(), "Shutting down");
    engine.stop()?;
    Ok(())
}

/// Block until Ctrl-C.
fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(tokio::signal::ctrl_c())
}
